//! Bit-level field extraction from packed CAN payloads
//!
//! Payloads are packed as little-endian 64-bit words (see
//! [`CanFrame::payload_u64`](crate::types::CanFrame::payload_u64)). A signal
//! occupies `bit_size` bits starting at `bit_pos`, counted from the least
//! significant bit of the packed word.
//!
//! There is no error path here: field ranges are validated when the
//! descriptor table is loaded, never at decode time.

/// Extract an unsigned field of `bit_size` bits at `bit_pos`, zero-extended.
///
/// Valid for all `bit_size` in 1..=64 with `bit_pos + bit_size <= 64`.
pub fn unsigned_field(data: u64, bit_pos: u8, bit_size: u8) -> u64 {
    (data >> bit_pos) & field_mask(bit_size)
}

/// Extract a signed field of `bit_size` bits at `bit_pos`, sign-extended.
///
/// If the top bit of the field is set, the inverse field mask is OR-ed into
/// the upper bits before reinterpreting as signed, so the result equals
/// `raw_field - 2^bit_size` for negative values.
pub fn signed_field(data: u64, bit_pos: u8, bit_size: u8) -> i64 {
    let mask = field_mask(bit_size);
    let field = (data >> bit_pos) & mask;
    let sign_bit = 1u64 << (bit_size - 1);
    if field & sign_bit == 0 {
        field as i64
    } else {
        (field | !mask) as i64
    }
}

// Shifting by the full word width is UB-adjacent in Rust, so the 64-bit
// mask is built by shifting MAX down instead of shifting 1 up.
fn field_mask(bit_size: u8) -> u64 {
    u64::MAX >> (64 - bit_size as u32)
}
