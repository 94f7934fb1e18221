//! Column codecs for block payloads
//!
//! Timestamps and values are stored as two independently compressed columns:
//! delta-of-delta for timestamps (exact), XOR for values (exact up to the
//! configured precision).

mod bitstream;
mod timestamps;
mod values;

pub use bitstream::{BitReader, BitWriter};
pub use timestamps::{TimestampDecoder, TimestampEncoder};
pub use values::{ValueDecoder, ValueEncoder};

/// Round `value` so that only `precision_bits` significant mantissa bits
/// survive, using round-half-to-even on the dropped bits.
///
/// An f64 mantissa stores 52 bits, so precisions of 52 and above keep the
/// value unchanged, as do zeros and non-finite values. Lower precisions
/// trade accuracy for much better XOR compression of noisy series.
pub fn round_to_precision_bits(value: f64, precision_bits: u8) -> f64 {
    if precision_bits >= 52 || value == 0.0 || !value.is_finite() {
        return value;
    }
    let precision_bits = precision_bits.max(1) as u32;
    let drop = 52 - precision_bits;
    let mask = (1u64 << drop) - 1;
    let half = 1u64 << (drop - 1);

    let bits = value.to_bits();
    let frac = bits & mask;
    let mut rounded = bits & !mask;
    if frac > half || (frac == half && (rounded >> drop) & 1 == 1) {
        // Mantissa carry may overflow into the exponent; that is the correct
        // rounded result for values at a power-of-two boundary.
        rounded = rounded.wrapping_add(1u64 << drop);
    }
    let out = f64::from_bits(rounded);
    if out.is_finite() {
        out
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lossless_precisions() {
        for bits in [53u8, 60, 64] {
            assert_eq!(round_to_precision_bits(3.141592653589793, bits), 3.141592653589793);
        }
        assert_eq!(round_to_precision_bits(0.0, 8), 0.0);
        assert!(round_to_precision_bits(f64::NAN, 8).is_nan());
        assert_eq!(round_to_precision_bits(f64::INFINITY, 8), f64::INFINITY);
    }

    #[test]
    fn test_rounding_within_tolerance() {
        for bits in 1u8..=52 {
            let tol = 2f64.powi(-(bits as i32));
            for &v in &[1.0_f64 / 3.0, 2.718281828, -12345.6789, 1e-9, 9.9e12] {
                let r = round_to_precision_bits(v, bits);
                let rel = ((r - v) / v).abs();
                assert!(
                    rel <= tol,
                    "bits={bits} v={v} r={r} rel={rel} tol={tol}"
                );
            }
        }
    }

    #[test]
    fn test_rounding_improves_compressibility() {
        // After rounding to 8 bits, the XOR of neighbouring noisy values
        // should have plenty of trailing zeros.
        let a = round_to_precision_bits(20.73419, 8);
        let b = round_to_precision_bits(20.73822, 8);
        let xor = a.to_bits() ^ b.to_bits();
        assert!(xor == 0 || xor.trailing_zeros() >= 32);
    }

    #[test]
    fn test_half_to_even() {
        // exact halfway fraction rounds to the even neighbour
        let drop = 52 - 4;
        let base = 1.5f64.to_bits() & !((1u64 << drop) - 1);
        let halfway = f64::from_bits(base | (1u64 << (drop - 1)));
        let r = round_to_precision_bits(halfway, 4);
        assert_eq!(r.to_bits() & ((1u64 << drop) - 1), 0);
    }
}
