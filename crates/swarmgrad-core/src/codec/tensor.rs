//! Minimal dense tensor used at the codec and trainer boundaries.

use serde::{Deserialize, Serialize};

use super::CodecError;

/// Row-major dense `f32` tensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl Tensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self, CodecError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(CodecError::ShapeMismatch {
                shape,
                len: data.len(),
            });
        }
        Ok(Self { shape, data })
    }

    pub fn zeros(shape: &[usize]) -> Self {
        let len = shape.iter().product();
        Self {
            shape: shape.to_vec(),
            data: vec![0.0; len],
        }
    }

    /// 1-D tensor over `data`.
    pub fn vector(data: Vec<f32>) -> Self {
        Self {
            shape: vec![data.len()],
            data,
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Elementwise sign; zero stays zero.
    pub fn signum(&self) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self
                .data
                .iter()
                .map(|&v| if v == 0.0 { 0.0 } else { v.signum() })
                .collect(),
        }
    }

    pub fn scaled(&self, factor: f32) -> Tensor {
        Tensor {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| v * factor).collect(),
        }
    }

    /// `self += factor * other`. Shapes must match.
    pub fn add_scaled(&mut self, other: &Tensor, factor: f32) -> Result<(), CodecError> {
        if self.shape != other.shape {
            return Err(CodecError::ShapeMismatch {
                shape: other.shape.clone(),
                len: self.data.len(),
            });
        }
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += factor * b;
        }
        Ok(())
    }

    pub fn l2_norm(&self) -> f64 {
        self.data
            .iter()
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_checks_element_count() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        assert!(Tensor::new(vec![2, 3], vec![0.0; 5]).is_err());
    }

    #[test]
    fn signum_keeps_zero() {
        let t = Tensor::vector(vec![-2.0, 0.0, 0.5]);
        assert_eq!(t.signum().data(), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn add_scaled_rejects_shape_mismatch() {
        let mut a = Tensor::zeros(&[2, 2]);
        let b = Tensor::zeros(&[4]);
        assert!(a.add_scaled(&b, 1.0).is_err());
    }

    #[test]
    fn l2_norm_of_345() {
        let t = Tensor::vector(vec![3.0, 4.0]);
        assert!((t.l2_norm() - 5.0).abs() < 1e-12);
    }
}
