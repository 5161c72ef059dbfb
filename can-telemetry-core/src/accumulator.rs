//! Per-channel running sample sets
//!
//! An accumulator holds the raw decoded values observed for one channel
//! since its last reset and exposes scaled read-only views over them. The
//! signed/unsigned split is a tagged variant chosen once at creation from
//! the signal's declared type.
//!
//! Scaling law: physical = raw * factor + offset. Because the transform is
//! affine, `mean` can average raw values before scaling. A negative factor
//! reverses the ordering between the raw and physical domains, so the
//! min/max index views swap the raw extrema in that case.

use crate::codec;
use crate::signals::database::{SignalDefinition, ValueType};

#[derive(Debug, Clone)]
enum RawValues {
    Unsigned(Vec<u64>),
    Signed(Vec<i64>),
}

/// Running min/max/mean/last statistics for one signal across a window
#[derive(Debug, Clone)]
pub struct Accumulator {
    signal: SignalDefinition,
    values: RawValues,
}

impl Accumulator {
    /// Create an empty accumulator for a signal, picking the signed or
    /// unsigned variant from the signal's declared type.
    pub fn new(signal: &SignalDefinition) -> Self {
        let values = match signal.value_type {
            ValueType::Unsigned => RawValues::Unsigned(Vec::new()),
            ValueType::Signed => RawValues::Signed(Vec::new()),
        };
        Self {
            signal: signal.clone(),
            values,
        }
    }

    /// The signal this accumulator samples
    pub fn signal(&self) -> &SignalDefinition {
        &self.signal
    }

    /// Decode the signal's raw value from a packed payload and append it.
    pub fn add_frame(&mut self, payload: u64) {
        let (pos, size) = (self.signal.bit_pos, self.signal.bit_size);
        match &mut self.values {
            RawValues::Unsigned(v) => v.push(codec::unsigned_field(payload, pos, size)),
            RawValues::Signed(v) => v.push(codec::signed_field(payload, pos, size)),
        }
    }

    /// True if any sample has been observed since the last reset
    pub fn has_value(&self) -> bool {
        self.len() > 0
    }

    /// Number of samples since the last reset
    pub fn len(&self) -> usize {
        match &self.values {
            RawValues::Unsigned(v) => v.len(),
            RawValues::Signed(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Scaled arithmetic mean of the raw samples
    pub fn mean(&self) -> Option<f64> {
        if self.is_empty() {
            return None;
        }
        let sum = match &self.values {
            RawValues::Unsigned(v) => v.iter().map(|&x| x as f64).sum::<f64>(),
            RawValues::Signed(v) => v.iter().map(|&x| x as f64).sum::<f64>(),
        };
        Some(self.scale(sum / self.len() as f64))
    }

    /// Scaled most recent sample
    pub fn last(&self) -> Option<f64> {
        self.at_index(self.len().checked_sub(1)?)
    }

    /// Scaled physical minimum
    pub fn min(&self) -> Option<f64> {
        self.at_index(self.min_index()?)
    }

    /// Scaled physical maximum
    pub fn max(&self) -> Option<f64> {
        self.at_index(self.max_index()?)
    }

    /// Index of the physical minimum (first occurrence).
    ///
    /// With a negative factor the raw maximum is the physical minimum.
    pub fn min_index(&self) -> Option<usize> {
        if self.signal.factor < 0.0 {
            self.raw_max_index()
        } else {
            self.raw_min_index()
        }
    }

    /// Index of the physical maximum (first occurrence).
    pub fn max_index(&self) -> Option<usize> {
        if self.signal.factor < 0.0 {
            self.raw_min_index()
        } else {
            self.raw_max_index()
        }
    }

    /// Scaled value of the i-th raw sample
    pub fn at_index(&self, index: usize) -> Option<f64> {
        let raw = match &self.values {
            RawValues::Unsigned(v) => *v.get(index)? as f64,
            RawValues::Signed(v) => *v.get(index)? as f64,
        };
        Some(self.scale(raw))
    }

    /// Clear the sample sequence
    pub fn reset(&mut self) {
        match &mut self.values {
            RawValues::Unsigned(v) => v.clear(),
            RawValues::Signed(v) => v.clear(),
        }
    }

    fn scale(&self, raw: f64) -> f64 {
        raw * self.signal.factor + self.signal.offset
    }

    fn raw_min_index(&self) -> Option<usize> {
        match &self.values {
            RawValues::Unsigned(v) => index_of_min(v),
            RawValues::Signed(v) => index_of_min(v),
        }
    }

    fn raw_max_index(&self) -> Option<usize> {
        match &self.values {
            RawValues::Unsigned(v) => index_of_max(v),
            RawValues::Signed(v) => index_of_max(v),
        }
    }
}

fn index_of_min<T: Ord + Copy>(values: &[T]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .min_by_key(|&(_, &v)| v)
        .map(|(i, _)| i)
}

fn index_of_max<T: Ord + Copy>(values: &[T]) -> Option<usize> {
    // max_by_key returns the last maximum; rev() keeps the first occurrence
    values
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|&(_, &v)| v)
        .map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelKey;

    fn signal(value_type: ValueType, factor: f64, offset: f64) -> SignalDefinition {
        SignalDefinition {
            name: "Test".to_string(),
            channel_key: ChannelKey(1),
            value_type,
            bit_pos: 0,
            bit_size: 16,
            factor,
            offset,
            minimum: 0.0,
            maximum: 0.0,
            unit: None,
        }
    }

    fn feed(acc: &mut Accumulator, raw: &[u64]) {
        for &r in raw {
            acc.add_frame(r);
        }
    }

    #[test]
    fn test_empty_accumulator_has_no_views() {
        let acc = Accumulator::new(&signal(ValueType::Unsigned, 1.0, 0.0));
        assert!(!acc.has_value());
        assert_eq!(acc.mean(), None);
        assert_eq!(acc.last(), None);
        assert_eq!(acc.min(), None);
        assert_eq!(acc.max(), None);
        assert_eq!(acc.min_index(), None);
        assert_eq!(acc.at_index(0), None);
    }

    #[test]
    fn test_mean_is_affine_over_raw_values() {
        let mut acc = Accumulator::new(&signal(ValueType::Unsigned, 0.5, -40.0));
        feed(&mut acc, &[140, 136, 144]);
        // (140+136+144)/3 * 0.5 - 40 = 30
        assert_eq!(acc.mean(), Some(30.0));
        assert_eq!(acc.last(), Some(32.0));
    }

    #[test]
    fn test_min_max_index_tracking() {
        let mut acc = Accumulator::new(&signal(ValueType::Unsigned, 0.5, -40.0));
        feed(&mut acc, &[140, 136, 144]);
        assert_eq!(acc.min_index(), Some(1));
        assert_eq!(acc.max_index(), Some(2));
        assert_eq!(acc.min(), Some(28.0));
        assert_eq!(acc.max(), Some(32.0));
        assert_eq!(acc.at_index(0), Some(30.0));
    }

    #[test]
    fn test_negative_factor_swaps_extrema() {
        // factor -0.1: raw 100 -> -10.0, raw 300 -> -30.0. The raw maximum
        // is the physical minimum.
        let mut acc = Accumulator::new(&signal(ValueType::Unsigned, -0.1, 0.0));
        feed(&mut acc, &[100, 300, 200]);
        assert_eq!(acc.min_index(), Some(1));
        assert_eq!(acc.max_index(), Some(0));
        assert_eq!(acc.min(), Some(-30.0));
        assert_eq!(acc.max(), Some(-10.0));
    }

    #[test]
    fn test_signed_decoding_and_extrema() {
        let mut acc = Accumulator::new(&signal(ValueType::Signed, 0.25, 0.0));
        // 16-bit fields: 0xFFF0 = -16, 0x0010 = 16
        feed(&mut acc, &[0xFFF0, 0x0010]);
        assert_eq!(acc.min(), Some(-4.0));
        assert_eq!(acc.max(), Some(4.0));
        assert_eq!(acc.mean(), Some(0.0));
    }

    #[test]
    fn test_first_occurrence_wins_on_ties() {
        let mut acc = Accumulator::new(&signal(ValueType::Unsigned, 1.0, 0.0));
        feed(&mut acc, &[5, 9, 5, 9]);
        assert_eq!(acc.min_index(), Some(0));
        assert_eq!(acc.max_index(), Some(1));
    }

    #[test]
    fn test_reset_clears_samples() {
        let mut acc = Accumulator::new(&signal(ValueType::Unsigned, 1.0, 0.0));
        feed(&mut acc, &[1, 2, 3]);
        assert!(acc.has_value());
        acc.reset();
        assert!(!acc.has_value());
        assert_eq!(acc.mean(), None);
    }
}
