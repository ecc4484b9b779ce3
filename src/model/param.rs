//! Named model parameter with gradient storage

use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, ArrayViewMut2};

/// A named, flat parameter buffer with an optional accumulated gradient
///
/// Data is stored flat; `shape` records the logical layout used when the
/// parameter is saved to or restored from a checkpoint.
#[derive(Clone, Debug)]
pub struct Param {
    name: String,
    shape: Vec<usize>,
    data: Array1<f32>,
    grad: Option<Array1<f32>>,
    trainable: bool,
}

impl Param {
    /// Create a trainable parameter from flat data
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(Error::ShapeMismatch {
                expected: shape,
                got: vec![data.len()],
            });
        }
        Ok(Self {
            name: name.into(),
            shape,
            data: Array1::from(data),
            grad: None,
            trainable: true,
        })
    }

    /// Create a zero-filled trainable parameter
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: Array1::zeros(size),
            grad: None,
            trainable: true,
        }
    }

    /// Mark this parameter as a non-trainable buffer (e.g. running statistics)
    pub fn frozen(mut self) -> Self {
        self.trainable = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn trainable(&self) -> bool {
        self.trainable
    }

    pub fn data(&self) -> &Array1<f32> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array1<f32> {
        &mut self.data
    }

    /// Replace the data, keeping the logical shape
    pub fn assign(&mut self, data: &[f32]) -> Result<()> {
        if data.len() != self.data.len() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: vec![data.len()],
            });
        }
        self.data = Array1::from(data.to_vec());
        Ok(())
    }

    pub fn grad(&self) -> Option<&Array1<f32>> {
        self.grad.as_ref()
    }

    pub fn set_grad(&mut self, grad: Array1<f32>) {
        self.grad = Some(grad);
    }

    /// Add to the stored gradient (for parameters used by several loss terms)
    pub fn accumulate_grad(&mut self, grad: &Array1<f32>) {
        match self.grad.as_mut() {
            Some(existing) => *existing += grad,
            None => self.grad = Some(grad.clone()),
        }
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }

    /// Take the gradient out, leaving none behind
    pub fn take_grad(&mut self) -> Option<Array1<f32>> {
        self.grad.take()
    }

    /// View a rank-2 parameter as a matrix
    pub fn as_matrix(&self) -> Result<ArrayView2<'_, f32>> {
        let (rows, cols) = self.matrix_dims()?;
        let slice = self
            .data
            .as_slice()
            .ok_or_else(|| Error::InvalidParameter(format!("{} is not contiguous", self.name)))?;
        ArrayView2::from_shape((rows, cols), slice)
            .map_err(|e| Error::InvalidParameter(format!("{}: {e}", self.name)))
    }

    /// Mutable matrix view of a rank-2 parameter
    pub fn as_matrix_mut(&mut self) -> Result<ArrayViewMut2<'_, f32>> {
        let (rows, cols) = self.matrix_dims()?;
        let name = self.name.clone();
        let slice = self
            .data
            .as_slice_mut()
            .ok_or_else(|| Error::InvalidParameter(format!("{name} is not contiguous")))?;
        ArrayViewMut2::from_shape((rows, cols), slice)
            .map_err(|e| Error::InvalidParameter(format!("{name}: {e}")))
    }

    /// Accumulate a matrix-shaped gradient into a rank-2 parameter
    pub fn accumulate_matrix_grad(&mut self, grad: &Array2<f32>) -> Result<()> {
        let (rows, cols) = self.matrix_dims()?;
        if grad.dim() != (rows, cols) {
            return Err(Error::ShapeMismatch {
                expected: vec![rows, cols],
                got: grad.shape().to_vec(),
            });
        }
        let flat: Array1<f32> = grad.iter().copied().collect();
        self.accumulate_grad(&flat);
        Ok(())
    }

    fn matrix_dims(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [rows, cols] => Ok((*rows, *cols)),
            other => Err(Error::InvalidParameter(format!(
                "{} has rank {} (expected 2)",
                self.name,
                other.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_param_shape_checked() {
        assert!(Param::new("w", vec![2, 2], vec![1.0; 3]).is_err());
        let p = Param::new("w", vec![2, 2], vec![1.0; 4]).unwrap();
        assert_eq!(p.len(), 4);
        assert!(p.trainable());
    }

    #[test]
    fn test_grad_accumulates() {
        let mut p = Param::zeros("b", vec![2]);
        p.accumulate_grad(&array![1.0, 2.0]);
        p.accumulate_grad(&array![0.5, 0.5]);
        assert_eq!(p.grad().unwrap(), &array![1.5, 2.5]);
        p.zero_grad();
        assert!(p.grad().is_none());
    }

    #[test]
    fn test_matrix_view_row_major() {
        let p = Param::new("w", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let m = p.as_matrix().unwrap();
        assert_eq!(m[[1, 0]], 4.0);
        assert_eq!(m[[0, 2]], 3.0);
    }

    #[test]
    fn test_matrix_grad_shape_mismatch() {
        let mut p = Param::zeros("w", vec![2, 3]);
        assert!(p.accumulate_matrix_grad(&Array2::zeros((3, 2))).is_err());
        assert!(p.accumulate_matrix_grad(&Array2::ones((2, 3))).is_ok());
        assert_eq!(p.grad().unwrap().sum(), 6.0);
    }

    #[test]
    fn test_frozen_param() {
        let p = Param::zeros("moving_mean", vec![4]).frozen();
        assert!(!p.trainable());
    }
}
