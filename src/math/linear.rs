//! Linear model evaluation.
//!
//! Models in this crate are plain linear combinations:
//!
//! ```text
//! y = β0 + Σ β_i x_i
//! ```
//!
//! The coefficient and feature vectors are assembled in the same (sorted
//! name) order and combined with a nalgebra dot product, so a given model and
//! feature map always evaluate in the same summation order.

use nalgebra::DVector;

/// Evaluate `intercept + coefficients · features`.
///
/// Returns `None` if any input or the result is non-finite.
pub fn linear_predict(intercept: f64, coefficients: &[f64], features: &[f64]) -> Option<f64> {
    if coefficients.len() != features.len() {
        return None;
    }
    let beta = DVector::from_column_slice(coefficients);
    let x = DVector::from_column_slice(features);
    let y = intercept + beta.dot(&x);
    y.is_finite().then_some(y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_simple_model() {
        // y = 2 + 3a - b at a=1, b=4
        let y = linear_predict(2.0, &[3.0, -1.0], &[1.0, 4.0]).unwrap();
        assert!((y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn non_finite_inputs_yield_none() {
        assert!(linear_predict(0.0, &[1.0], &[f64::NAN]).is_none());
        assert!(linear_predict(f64::INFINITY, &[], &[]).is_none());
        assert!(linear_predict(0.0, &[1.0, 2.0], &[1.0]).is_none());
    }
}
