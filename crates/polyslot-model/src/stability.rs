//! Numerical stability checks
//!
//! Used before a unit is written to disk: a checkpoint holding NaN or Inf
//! weights would poison every later resume.

use crate::Parameter;
use anyhow::Result;
use ndarray::Array2;

/// Check if a matrix contains any NaN values
pub fn has_nan(values: &Array2<f32>) -> bool {
    values.iter().any(|x| x.is_nan())
}

/// Check if a matrix contains any Inf values
pub fn has_inf(values: &Array2<f32>) -> bool {
    values.iter().any(|x| x.is_infinite())
}

/// Validate that a matrix doesn't contain NaN or Inf values
///
/// # Arguments
/// * `values` - Matrix to validate
/// * `name` - Name of the matrix for error messages
///
/// # Returns
/// Error if the matrix contains NaN or Inf
pub fn validate_tensor(values: &Array2<f32>, name: &str) -> Result<()> {
    if has_nan(values) {
        anyhow::bail!("Tensor '{}' contains NaN values", name);
    }
    if has_inf(values) {
        anyhow::bail!("Tensor '{}' contains Inf values", name);
    }
    Ok(())
}

/// Validate every parameter of a unit
pub fn validate_parameters(params: &[&Parameter]) -> Result<()> {
    for param in params {
        validate_tensor(&param.value, &param.name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_tensor() {
        let values = Array2::<f32>::ones((2, 3));
        assert!(validate_tensor(&values, "test").is_ok());
    }

    #[test]
    fn test_validate_tensor_rejects_nan_and_inf() {
        let mut values = Array2::<f32>::zeros((2, 2));
        values[[0, 1]] = f32::NAN;
        assert!(has_nan(&values));
        assert!(validate_tensor(&values, "w").is_err());

        values[[0, 1]] = f32::INFINITY;
        assert!(!has_nan(&values));
        assert!(has_inf(&values));
        let err = validate_tensor(&values, "w").unwrap_err();
        assert!(err.to_string().contains("Inf"));
    }
}
