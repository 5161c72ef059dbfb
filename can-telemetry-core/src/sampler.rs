//! Sampling engine: frame ingestion, window expiry and batch emission
//!
//! Frames are decoded into per-channel accumulators. Two rolling windows
//! run on fixed grids: a short window for fast-moving channels and a long
//! window for slow counters and energy totals. When a window expires the
//! engine evaluates a fixed, ordered rule set over the accumulators and
//! hands the resulting record batch to the collector's queue.
//!
//! Batch timestamps are canonical: the greatest multiple of the short
//! window length at or below the triggering timestamp, so batches land on
//! a stable grid even when the expiry check happens late.

use crate::accumulator::Accumulator;
use crate::signals::database::SignalDatabase;
use crate::types::{Batch, CanFrame, ChannelKey, Record, Timestamp};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;

/// Short aggregation window (fast channels)
pub const SHORT_WINDOW_MS: i64 = 5_000;

/// Long aggregation window (counters, energy totals)
pub const LONG_WINDOW_MS: i64 = 60_000;

/// Greatest multiple of `window_ms` at or below `ts`
pub fn grid_floor(ts: Timestamp, window_ms: i64) -> Timestamp {
    to_timestamp(ts.timestamp_millis().div_euclid(window_ms) * window_ms)
}

/// Smallest multiple of `window_ms` strictly after `ts`
pub fn next_boundary(ts: Timestamp, window_ms: i64) -> Timestamp {
    to_timestamp((ts.timestamp_millis().div_euclid(window_ms) + 1) * window_ms)
}

fn to_timestamp(ms: i64) -> Timestamp {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    next_short: Timestamp,
    next_long: Timestamp,
}

/// Keys of one paired-extrema channel family (cell temperatures or cell
/// voltages)
struct ExtremaKeys {
    min: ChannelKey,
    min_num: ChannelKey,
    mid: ChannelKey,
    max: ChannelKey,
    max_num: ChannelKey,
    /// The voltage family computes its mid channel from the inner extremes
    /// (max of the minima, min of the maxima); kept as-is from the source
    /// behavior.
    mid_from_inner: bool,
}

/// The decode-and-aggregate engine
///
/// Owned exclusively by the frame-reading thread; the descriptor table is
/// shared immutably.
pub struct SamplingEngine {
    db: Arc<SignalDatabase>,
    sink: mpsc::Sender<Batch>,
    values: HashMap<ChannelKey, Accumulator>,
    windows: Option<WindowState>,
}

impl SamplingEngine {
    pub fn new(db: Arc<SignalDatabase>, sink: mpsc::Sender<Batch>) -> Self {
        Self {
            db,
            sink,
            values: HashMap::new(),
            windows: None,
        }
    }

    /// Arm both windows at the first grid boundary strictly after `now`.
    pub fn start(&mut self, now: Timestamp) {
        self.windows = Some(WindowState {
            next_short: next_boundary(now, SHORT_WINDOW_MS),
            next_long: next_boundary(now, LONG_WINDOW_MS),
        });
        log::debug!("sampling started at {}", now);
    }

    /// Decode a frame and append raw values to the accumulators of its
    /// active channel-bearing signals. Unknown frames are silently ignored.
    pub fn ingest_frame(&mut self, frame: &CanFrame, ts: Timestamp) {
        log::trace!("frame {} at {}", frame, ts);
        let payload = frame.payload_u64();
        let db = Arc::clone(&self.db);
        for signal in db.resolve_active_signals(frame) {
            if !signal.channel_key.is_recordable() {
                continue;
            }
            self.values
                .entry(signal.channel_key)
                .or_insert_with(|| Accumulator::new(signal))
                .add_frame(payload);
        }
    }

    /// Flush expired windows.
    ///
    /// Emits at most one batch per call, timestamped on the short-window
    /// grid, then advances whichever window boundary was crossed. Reaching
    /// the long boundary with unread samples left is a diagnostic; all
    /// accumulators are cleared to bound memory for channels without an
    /// emission rule.
    pub fn check_expiry(&mut self, ts: Timestamp) {
        let Some(windows) = self.windows else {
            return;
        };
        let expired_short = ts >= windows.next_short;
        let expired_long = ts >= windows.next_long;
        if !expired_short && !expired_long {
            return;
        }

        let rounded = grid_floor(ts, SHORT_WINDOW_MS);
        let batch = self.collect_records(rounded, expired_long);
        if !batch.is_empty() {
            log::debug!("flushing {} records at {}", batch.len(), rounded);
            if self.sink.send(batch).is_err() {
                log::warn!("record sink disconnected, dropping batch");
            }
        }

        let mut windows = windows;
        if expired_short {
            windows.next_short = next_boundary(ts, SHORT_WINDOW_MS);
        }
        if expired_long {
            windows.next_long = next_boundary(ts, LONG_WINDOW_MS);
            let unread = self.values.values().filter(|a| a.has_value()).count();
            if unread > 0 {
                log::warn!(
                    "{} channels held unread samples past the long window, clearing all",
                    unread
                );
                self.values.clear();
            }
        }
        self.windows = Some(windows);
    }

    /// The accumulator for a channel, if it holds any samples
    pub fn accumulator(&self, key: ChannelKey) -> Option<&Accumulator> {
        self.values.get(&key).filter(|a| a.has_value())
    }

    fn stat(&self, key: ChannelKey, view: fn(&Accumulator) -> Option<f64>) -> Option<f64> {
        self.accumulator(key).and_then(view)
    }

    fn reset(&mut self, key: ChannelKey) {
        if let Some(acc) = self.values.get_mut(&key) {
            acc.reset();
        }
    }

    fn emit_simple(
        &mut self,
        batch: &mut Batch,
        time: Timestamp,
        key: ChannelKey,
        view: fn(&Accumulator) -> Option<f64>,
    ) {
        if let Some(value) = self.stat(key, view) {
            batch.push(Record {
                timestamp: time,
                channel: key,
                value,
            });
        }
        self.reset(key);
    }

    fn emit_extrema(&mut self, batch: &mut Batch, time: Timestamp, keys: ExtremaKeys) {
        let push = |batch: &mut Batch, channel: ChannelKey, value: f64| {
            batch.push(Record {
                timestamp: time,
                channel,
                value,
            })
        };

        {
            let min_acc = self.accumulator(keys.min);
            let max_acc = self.accumulator(keys.max);

            if let Some(min) = min_acc {
                if let Some(v) = min.min() {
                    push(batch, keys.min, v);
                }
                if let (Some(num), Some(idx)) = (self.accumulator(keys.min_num), min.min_index())
                {
                    if let Some(v) = num.at_index(idx) {
                        push(batch, keys.min_num, v);
                    }
                }
            }

            let mid = match (min_acc, max_acc) {
                (Some(min), Some(max)) => {
                    if keys.mid_from_inner {
                        min.max().zip(max.min()).map(|(a, b)| (a + b) / 2.0)
                    } else {
                        min.min().zip(max.max()).map(|(a, b)| (a + b) / 2.0)
                    }
                }
                _ => None,
            };
            if let Some(v) = mid {
                push(batch, keys.mid, v);
            }

            if let Some(max) = max_acc {
                if let Some(v) = max.max() {
                    push(batch, keys.max, v);
                }
                if let (Some(num), Some(idx)) = (self.accumulator(keys.max_num), max.max_index())
                {
                    if let Some(v) = num.at_index(idx) {
                        push(batch, keys.max_num, v);
                    }
                }
            }
        }

        for key in [keys.min, keys.min_num, keys.max, keys.max_num] {
            self.reset(key);
        }
    }

    /// Evaluate the emission rule set for one window boundary.
    ///
    /// Rules run in a fixed order; every rule checks presence of its
    /// inputs and omits its output channel when they are absent. Each
    /// contributing accumulator is reset after inclusion.
    fn collect_records(&mut self, time: Timestamp, long_expired: bool) -> Batch {
        let mut batch = Batch::new();
        let push = |batch: &mut Batch, channel: ChannelKey, value: f64| {
            batch.push(Record {
                timestamp: time,
                channel,
                value,
            })
        };

        // Cell temperature extrema only settle once per long window; cell
        // voltage extrema go out every tick.
        if long_expired {
            self.emit_extrema(
                &mut batch,
                time,
                ExtremaKeys {
                    min: ChannelKey::CELL_TEMP_MIN,
                    min_num: ChannelKey::CELL_TEMP_MIN_NUM,
                    mid: ChannelKey::CELL_TEMP_MID,
                    max: ChannelKey::CELL_TEMP_MAX,
                    max_num: ChannelKey::CELL_TEMP_MAX_NUM,
                    mid_from_inner: false,
                },
            );
        }
        self.emit_extrema(
            &mut batch,
            time,
            ExtremaKeys {
                min: ChannelKey::CELL_VOLT_MIN,
                min_num: ChannelKey::CELL_VOLT_MIN_NUM,
                mid: ChannelKey::CELL_VOLT_MID,
                max: ChannelKey::CELL_VOLT_MAX,
                max_num: ChannelKey::CELL_VOLT_MAX_NUM,
                mid_from_inner: true,
            },
        );

        self.emit_simple(&mut batch, time, ChannelKey::ODOMETER, Accumulator::last);
        self.emit_simple(
            &mut batch,
            time,
            ChannelKey::MAX_DISCHARGE_POWER,
            Accumulator::max,
        );

        // Battery power and consumption derive from the voltage, current
        // and speed means of the same window.
        {
            let volt = self.stat(ChannelKey::BATTERY_VOLTAGE, Accumulator::mean);
            let amp = self.stat(ChannelKey::BATTERY_CURRENT, Accumulator::mean);
            let speed = self.stat(ChannelKey::SPEED, Accumulator::mean);

            if let Some(u) = volt {
                push(&mut batch, ChannelKey::BATTERY_VOLTAGE, u);
            }
            if let (Some(i), Some(u)) = (amp, volt) {
                push(&mut batch, ChannelKey::BATTERY_POWER, i * u / 1000.0);
            }
            if let Some(i) = amp {
                push(&mut batch, ChannelKey::BATTERY_CURRENT, i);
            }
            if let (Some(i), Some(u), Some(s)) = (amp, volt, speed) {
                // guards the division against a standing vehicle
                if s.abs() > 0.1 {
                    push(&mut batch, ChannelKey::CONSUMPTION, i * u / 1000.0 / s);
                }
            }
            if let Some(s) = speed {
                push(&mut batch, ChannelKey::SPEED, s);
            }

            self.reset(ChannelKey::BATTERY_VOLTAGE);
            self.reset(ChannelKey::BATTERY_CURRENT);
            self.reset(ChannelKey::SPEED);
        }

        self.emit_simple(&mut batch, time, ChannelKey::BATTERY_INLET, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::RADIATOR_BYPASS, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::PT_INLET, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::FRONT_TORQUE, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::REAR_TORQUE, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::ACCEL_PEDAL, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::FRONT_POWER, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::REAR_POWER, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::REAR_STATOR_TEMP, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::FRONT_STATOR_TEMP, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::POWERTRAIN_FLOW, Accumulator::mean);
        self.emit_simple(&mut batch, time, ChannelKey::BATTERY_FLOW, Accumulator::mean);

        if long_expired {
            self.emit_simple(&mut batch, time, ChannelKey::AC_CHARGE_TOTAL, Accumulator::last);
            self.emit_simple(&mut batch, time, ChannelKey::DC_CHARGE_TOTAL, Accumulator::last);
            self.emit_simple(&mut batch, time, ChannelKey::CHARGE_TOTAL, Accumulator::last);
            self.emit_simple(&mut batch, time, ChannelKey::REGEN_TOTAL, Accumulator::last);
            self.emit_simple(&mut batch, time, ChannelKey::DISCHARGE_TOTAL, Accumulator::last);

            // State of charge needs all three energy inputs from the same
            // window; the inputs are also recorded on their own channels.
            {
                let remaining = self.stat(ChannelKey::NOMINAL_REMAINING, Accumulator::last);
                let full = self.stat(ChannelKey::NOMINAL_FULL_PACK, Accumulator::last);
                let buffer = self.stat(ChannelKey::ENERGY_BUFFER, Accumulator::last);

                if let (Some(r), Some(f), Some(b)) = (remaining, full, buffer) {
                    push(&mut batch, ChannelKey::SOC, (r - b) / (f - b) * 100.0);
                }
                if let Some(f) = full {
                    push(&mut batch, ChannelKey::NOMINAL_FULL_PACK, f);
                }
                if let Some(r) = remaining {
                    push(&mut batch, ChannelKey::NOMINAL_REMAINING, r);
                }
                if let Some(b) = buffer {
                    push(&mut batch, ChannelKey::ENERGY_BUFFER, b);
                }

                self.reset(ChannelKey::NOMINAL_REMAINING);
                self.reset(ChannelKey::NOMINAL_FULL_PACK);
                self.reset(ChannelKey::ENERGY_BUFFER);
            }

            self.emit_simple(&mut batch, time, ChannelKey::SOC_UI, Accumulator::last);
            self.emit_simple(&mut batch, time, ChannelKey::SOC_MIN, Accumulator::min);
            self.emit_simple(&mut batch, time, ChannelKey::EXPECTED_REMAINING, Accumulator::mean);
            self.emit_simple(&mut batch, time, ChannelKey::IDEAL_REMAINING, Accumulator::mean);
            self.emit_simple(&mut batch, time, ChannelKey::OUTSIDE_TEMP_FILTERED, Accumulator::mean);
            self.emit_simple(&mut batch, time, ChannelKey::OUTSIDE_TEMP, Accumulator::mean);
        }

        // Individually indexed battery cell voltages; reset as they go.
        for cell in 0..ChannelKey::CELL_COUNT {
            self.emit_simple(
                &mut batch,
                time,
                ChannelKey::cell_voltage(cell),
                Accumulator::last,
            );
        }

        batch
    }
}
