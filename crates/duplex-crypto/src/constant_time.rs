//! Constant-time comparisons for secret-dependent data.

use subtle::ConstantTimeEq;

/// Timing-safe 8-byte array comparison (key fingerprints).
#[must_use]
pub fn verify_8(a: &[u8; 8], b: &[u8; 8]) -> bool {
    a.ct_eq(b).into()
}
