//! Shared helpers for coordinate conversions.
//!
//! Event coordinates are stored as `NUMERIC(20, 15)` and surface as `Decimal`;
//! the enrichment core and the downstream services work in `f64`.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;

/// Number of decimal places kept when coordinates are used as a cache key.
/// Three places is roughly 110 m at the equator.
pub(crate) const COORD_KEY_PRECISION: u32 = 3;

/// Convert an f64 to Decimal preserving full precision.
///
/// Returns `Decimal::ZERO` for non-finite input.
pub(crate) fn f64_to_decimal_full(v: f64) -> Decimal {
    if !v.is_finite() {
        tracing::warn!(
            "f64_to_decimal_full received non-finite value {}, defaulting to 0",
            v
        );
        return Decimal::ZERO;
    }
    Decimal::from_f64(v).unwrap_or_else(|| Decimal::new(v as i64, 0))
}

/// Convert a Decimal to f64, defaulting to 0.0 for values that can't be represented.
pub(crate) fn dec_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

/// Quantise a coordinate to `COORD_KEY_PRECISION` places as a fixed-point integer,
/// so float noise in user input doesn't fragment the cache.
pub(crate) fn coordinate_key(v: f64) -> i64 {
    let scale = 10f64.powi(COORD_KEY_PRECISION as i32);
    (v * scale).round() as i64
}

pub(crate) fn is_valid_latitude(v: f64) -> bool {
    v.is_finite() && (-90.0..=90.0).contains(&v)
}

pub(crate) fn is_valid_longitude(v: f64) -> bool {
    v.is_finite() && (-180.0..=180.0).contains(&v)
}
