//! Row-major dense tensor value type passed between layers and across the
//! wire between worker hops (§3).

use rt_common::{Result, RuntimeError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Tensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let n = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![0.0; n] }
    }

    pub fn from_vec(shape: &[usize], data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(RuntimeError::ShapeError(format!(
                "shape {:?} expects {} elements, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape: shape.to_vec(), data })
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Size of every dimension after the leading one, i.e. the per-row width.
    pub fn row_width(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    /// Returns the contiguous slice for rows `[start, start + len)` along the
    /// leading dimension, used to split a packed batch tensor back into
    /// per-request segments.
    pub fn row_slice(&self, start: usize, len: usize) -> Result<Tensor> {
        let width = self.row_width();
        let lo = start * width;
        let hi = (start + len) * width;
        if hi > self.data.len() {
            return Err(RuntimeError::ShapeError(format!(
                "row range [{},{}) out of bounds for {} rows",
                start,
                start + len,
                self.rows()
            )));
        }
        let mut shape = self.shape.clone();
        shape[0] = len;
        Ok(Tensor { shape, data: self.data[lo..hi].to_vec() })
    }

    /// Concatenates tensors along the leading dimension, preserving the
    /// order they're given in. Used both to pack per-request segments into
    /// a batch and to append new K/V onto cached history.
    pub fn cat_rows(parts: &[&Tensor]) -> Result<Tensor> {
        let Some(first) = parts.first() else {
            return Err(RuntimeError::ShapeError("cat_rows of empty list".into()));
        };
        let tail = &first.shape[1..];
        let mut rows = 0;
        let mut data = Vec::new();
        for p in parts {
            if &p.shape[1..] != tail {
                return Err(RuntimeError::ShapeError(format!(
                    "cat_rows shape mismatch: {:?} vs {:?}",
                    p.shape, first.shape
                )));
            }
            rows += p.rows();
            data.extend_from_slice(&p.data);
        }
        let mut shape = vec![rows];
        shape.extend_from_slice(tail);
        Ok(Tensor { shape, data })
    }

    pub fn assert_2d(&self) -> Result<(usize, usize)> {
        match self.shape.as_slice() {
            [r, c] => Ok((*r, *c)),
            _ => Err(RuntimeError::ShapeError(format!("expected 2D tensor, got {:?}", self.shape))),
        }
    }
}
