//! Log-domain probability arithmetic.
//!
//! All PageRank mass is stored as the natural logarithm of a probability, so
//! that graphs with many nodes do not underflow. `-∞` represents an exact
//! zero probability and is the identity of [`log_sum_exp`].

/// The log-domain representation of zero mass.
pub const NEG_INF: f64 = f64::NEG_INFINITY;

/// Computes `ln(exp(a) + exp(b))` without leaving the log domain.
///
/// Commutative, and `-∞` is the identity, so callers never need to special
/// case nodes that received no mass.
#[inline]
pub fn log_sum_exp(a: f64, b: f64) -> f64 {
    if a == NEG_INF {
        return b;
    }
    if b == NEG_INF {
        return a;
    }
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    hi + (lo - hi).exp().ln_1p()
}

/// Folds [`log_sum_exp`] over a sequence, starting from `-∞`.
pub fn log_sum_exp_all<I: IntoIterator<Item = f64>>(values: I) -> f64 {
    values.into_iter().fold(NEG_INF, log_sum_exp)
}

/// The probability mass that was not delivered along links, given the
/// log-domain total of the delivered mass.
///
/// The result is clamped to `[0 . . 1]`: a delivered total that rounds
/// slightly above `ln(1)` means nothing was lost.
pub fn missing_mass(delivered: f64) -> f64 {
    (1.0 - delivered.exp()).clamp(0.0, 1.0)
}
