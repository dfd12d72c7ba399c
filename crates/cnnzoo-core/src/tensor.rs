use crate::dtype::Float;
use crate::error::{TensorError, TensorResult};
use crate::shape::Shape;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

/// N-dimensional tensor backed by a flat row-major `Vec<T>`.
///
/// Image batches use the `[N, C, H, W]` layout throughout the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "T: Float")]
pub struct Tensor<T: Float> {
    data: Vec<T>,
    shape: Shape,
}

fn rng_from(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

// ─── Construction ───────────────────────────────────────────────────────────

impl<T: Float> Tensor<T> {
    /// Create a tensor from raw data and shape.
    pub fn new(data: Vec<T>, shape: Vec<usize>) -> TensorResult<Self> {
        let s = Shape::new(shape);
        if data.len() != s.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: s.to_vec(),
                got: vec![data.len()],
            });
        }
        Ok(Tensor { data, shape: s })
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ZERO)
    }

    pub fn ones(shape: Vec<usize>) -> Self {
        Self::full(shape, T::ONE)
    }

    /// Create a tensor filled with a constant value.
    pub fn full(shape: Vec<usize>, value: T) -> Self {
        let s = Shape::new(shape);
        Tensor {
            data: vec![value; s.numel()],
            shape: s,
        }
    }

    /// Uniform samples in `[0, 1)`.
    pub fn rand(shape: Vec<usize>, seed: Option<u64>) -> Self {
        Self::rand_uniform(shape, 0.0, 1.0, seed)
    }

    /// Uniform samples in `[low, high)`.
    pub fn rand_uniform(shape: Vec<usize>, low: f64, high: f64, seed: Option<u64>) -> Self {
        let s = Shape::new(shape);
        let mut rng = rng_from(seed);
        let span = high - low;
        let data = (0..s.numel())
            .map(|_| T::from_f64(low + span * rng.gen::<f64>()))
            .collect();
        Tensor { data, shape: s }
    }

    /// Standard normal samples (Box-Muller).
    pub fn randn(shape: Vec<usize>, seed: Option<u64>) -> Self {
        let s = Shape::new(shape);
        let mut rng = rng_from(seed);
        let n = s.numel();
        let mut data = Vec::with_capacity(n + 1);

        while data.len() < n {
            let u1: f64 = rng.gen::<f64>().max(1e-10);
            let u2: f64 = rng.gen::<f64>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f64::consts::PI * u2;
            data.push(T::from_f64(r * theta.cos()));
            data.push(T::from_f64(r * theta.sin()));
        }
        data.truncate(n);
        Tensor { data, shape: s }
    }

    // ─── Accessors ──────────────────────────────────────────────────────────

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn shape_vec(&self) -> Vec<usize> {
        self.shape.to_vec()
    }

    pub fn ndim(&self) -> usize {
        self.shape.ndim()
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    fn offset(&self, indices: &[usize]) -> TensorResult<usize> {
        if indices.len() != self.ndim() {
            return Err(TensorError::DimensionMismatch(format!(
                "Expected {} indices, got {}",
                self.ndim(),
                indices.len()
            )));
        }
        let strides = self.shape.strides();
        let mut offset = 0;
        for (axis, (&idx, &size)) in indices.iter().zip(self.shape.dims()).enumerate() {
            if idx >= size {
                return Err(TensorError::IndexOutOfBounds {
                    index: idx,
                    axis,
                    size,
                });
            }
            offset += idx * strides[axis];
        }
        Ok(offset)
    }

    /// Read one element by multi-dimensional index.
    pub fn get(&self, indices: &[usize]) -> TensorResult<T> {
        let offset = self.offset(indices)?;
        Ok(self.data[offset])
    }

    /// Write one element by multi-dimensional index.
    pub fn set(&mut self, indices: &[usize], value: T) -> TensorResult<()> {
        let offset = self.offset(indices)?;
        self.data[offset] = value;
        Ok(())
    }

    // ─── Shape Manipulation ─────────────────────────────────────────────────

    /// Same data under a new shape with the same element count.
    pub fn reshape(&self, new_shape: Vec<usize>) -> TensorResult<Tensor<T>> {
        let ns = Shape::new(new_shape);
        if self.numel() != ns.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: ns.to_vec(),
                got: self.shape_vec(),
            });
        }
        Ok(Tensor {
            data: self.data.clone(),
            shape: ns,
        })
    }

    /// Consuming variant of [`Tensor::reshape`] that reuses the buffer.
    pub fn into_reshape(self, new_shape: Vec<usize>) -> TensorResult<Tensor<T>> {
        let ns = Shape::new(new_shape);
        if self.numel() != ns.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: ns.to_vec(),
                got: self.shape_vec(),
            });
        }
        Ok(Tensor {
            data: self.data,
            shape: ns,
        })
    }

    // ─── Element-wise Operations ────────────────────────────────────────────

    pub fn apply<F: Fn(T) -> T>(&self, f: F) -> Tensor<T> {
        Tensor {
            data: self.data.iter().map(|&x| f(x)).collect(),
            shape: self.shape.clone(),
        }
    }

    pub fn apply_mut<F: Fn(T) -> T>(&mut self, f: F) {
        self.data.iter_mut().for_each(|x| *x = f(*x));
    }

    pub fn relu(&self) -> Tensor<T> {
        self.apply(|x| x.max(T::ZERO))
    }

    fn broadcast_binary_op<F: Fn(T, T) -> T>(
        &self,
        other: &Tensor<T>,
        op: F,
    ) -> TensorResult<Tensor<T>> {
        if self.shape == other.shape {
            let data = self
                .data
                .iter()
                .zip(&other.data)
                .map(|(&a, &b)| op(a, b))
                .collect();
            return Ok(Tensor {
                data,
                shape: self.shape.clone(),
            });
        }

        let out_shape = Shape::broadcast_shape(&self.shape, &other.shape)?;
        let out_dims = out_shape.dims();
        let ndim = out_dims.len();
        let out_strides = out_shape.strides();

        // Strides of each operand aligned to the output rank, 0 on broadcast axes.
        let aligned = |t: &Tensor<T>| -> Vec<usize> {
            let pad = ndim - t.ndim();
            let strides = t.shape.strides();
            (0..ndim)
                .map(|d| {
                    if d < pad || t.shape.dims()[d - pad] == 1 {
                        0
                    } else {
                        strides[d - pad]
                    }
                })
                .collect()
        };
        let a_strides = aligned(self);
        let b_strides = aligned(other);

        let data = (0..out_shape.numel())
            .map(|flat| {
                let mut remaining = flat;
                let (mut a_off, mut b_off) = (0, 0);
                for d in 0..ndim {
                    let idx = remaining / out_strides[d];
                    remaining %= out_strides[d];
                    a_off += idx * a_strides[d];
                    b_off += idx * b_strides[d];
                }
                op(self.data[a_off], other.data[b_off])
            })
            .collect();

        Ok(Tensor {
            data,
            shape: out_shape,
        })
    }

    pub fn add(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        self.broadcast_binary_op(other, |a, b| a + b)
    }

    /// In-place `self += other` for tensors of identical shape.
    pub fn add_assign(&mut self, other: &Tensor<T>) -> TensorResult<()> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape_vec(),
                got: other.shape_vec(),
            });
        }
        for (a, &b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    // ─── Reductions ─────────────────────────────────────────────────────────

    /// Index of the largest entry in each row of a 2-D tensor.
    pub fn argmax_rows(&self) -> TensorResult<Vec<usize>> {
        if self.ndim() != 2 {
            return Err(TensorError::InvalidOperation(
                "argmax_rows() requires a 2D tensor".to_string(),
            ));
        }
        let cols = self.shape.dim(1)?;
        if cols == 0 {
            return Err(TensorError::EmptyTensor);
        }
        Ok(self
            .data
            .chunks(cols)
            .map(|row| {
                let mut best = 0;
                for (i, &v) in row.iter().enumerate() {
                    if v > row[best] {
                        best = i;
                    }
                }
                best
            })
            .collect())
    }

    pub fn has_nan(&self) -> bool {
        self.data.iter().any(|v| !v.is_finite())
    }

    // ─── Linear Algebra ─────────────────────────────────────────────────────

    /// 2D matrix multiply `[m, k] x [k, n] -> [m, n]`.
    pub fn matmul(&self, other: &Tensor<T>) -> TensorResult<Tensor<T>> {
        let (m, k) = match *self.shape.dims() {
            [m, k] => (m, k),
            _ => {
                return Err(TensorError::InvalidOperation(
                    "matmul requires 2D tensors".to_string(),
                ))
            }
        };
        let (k2, n) = match *other.shape.dims() {
            [k2, n] => (k2, n),
            _ => {
                return Err(TensorError::InvalidOperation(
                    "matmul requires 2D tensors".to_string(),
                ))
            }
        };
        if k != k2 {
            return Err(TensorError::DimensionMismatch(format!(
                "matmul: inner dimensions must match, got {} and {}",
                k, k2
            )));
        }

        let mut data = vec![T::ZERO; m * n];
        for i in 0..m {
            let a_row = &self.data[i * k..(i + 1) * k];
            let out_row = &mut data[i * n..(i + 1) * n];
            for (p, &a) in a_row.iter().enumerate() {
                let b_row = &other.data[p * n..(p + 1) * n];
                for (o, &b) in out_row.iter_mut().zip(b_row) {
                    *o += a * b;
                }
            }
        }
        Tensor::new(data, vec![m, n])
    }
}

impl<T: Float> PartialEq for Tensor<T> {
    fn eq(&self, other: &Self) -> bool {
        self.shape == other.shape && self.data == other.data
    }
}

impl<T: Float> fmt::Display for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ndim() == 2 {
            let rows = self.shape.dims()[0];
            let cols = self.shape.dims()[1];
            writeln!(f, "tensor([")?;
            for row in self.data.chunks(cols.max(1)).take(rows.min(8)) {
                write!(f, "  [")?;
                for (j, v) in row.iter().take(8).enumerate() {
                    if j > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:.4}", v)?;
                }
                if cols > 8 {
                    write!(f, ", ...")?;
                }
                writeln!(f, "],")?;
            }
            if rows > 8 {
                writeln!(f, "  ...")?;
            }
            return write!(f, "], shape={})", self.shape);
        }
        write!(f, "tensor(shape={}, numel={})", self.shape, self.numel())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_creation() {
        let t: Tensor<f32> = Tensor::zeros(vec![2, 3, 4, 4]);
        assert_eq!(t.shape_vec(), vec![2, 3, 4, 4]);
        assert_eq!(t.numel(), 96);

        let t: Tensor<f32> = Tensor::ones(vec![2, 3]);
        assert_eq!(t.data(), &[1.0; 6]);

        assert!(Tensor::<f32>::new(vec![1.0, 2.0], vec![3]).is_err());
    }

    #[test]
    fn test_get_set_nchw() {
        let mut t: Tensor<f32> = Tensor::zeros(vec![1, 2, 3, 3]);
        t.set(&[0, 1, 2, 0], 5.0).unwrap();
        assert_eq!(t.get(&[0, 1, 2, 0]).unwrap(), 5.0);
        assert_eq!(t.data()[9 + 6], 5.0);
        assert!(t.get(&[0, 2, 0, 0]).is_err());
        assert!(t.get(&[0, 0]).is_err());
    }

    #[test]
    fn test_seeded_rand_is_reproducible() {
        let a: Tensor<f32> = Tensor::rand_uniform(vec![16], -2.0, 2.0, Some(7));
        let b: Tensor<f32> = Tensor::rand_uniform(vec![16], -2.0, 2.0, Some(7));
        assert_eq!(a, b);
        assert!(a.data().iter().all(|&v| (-2.0..2.0).contains(&v)));
    }

    #[test]
    fn test_randn_odd_length() {
        let t: Tensor<f64> = Tensor::randn(vec![5], Some(1));
        assert_eq!(t.numel(), 5);
        assert!(!t.has_nan());
    }

    #[test]
    fn test_broadcast_add_bias_row() {
        let x: Tensor<f32> = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let b: Tensor<f32> = Tensor::new(vec![10.0, 20.0, 30.0], vec![1, 3]).unwrap();
        let y = x.add(&b).unwrap();
        assert_eq!(y.data(), &[11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_add_assign_shape_checked() {
        let mut a: Tensor<f32> = Tensor::ones(vec![2, 2]);
        a.add_assign(&Tensor::ones(vec![2, 2])).unwrap();
        assert_eq!(a.data(), &[2.0; 4]);
        assert!(a.add_assign(&Tensor::ones(vec![4])).is_err());
    }

    #[test]
    fn test_matmul() {
        let a: Tensor<f64> = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]).unwrap();
        let b: Tensor<f64> =
            Tensor::new(vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0], vec![3, 2]).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.shape_vec(), vec![2, 2]);
        assert_abs_diff_eq!(c.data()[0], 58.0);
        assert_abs_diff_eq!(c.data()[1], 64.0);
        assert_abs_diff_eq!(c.data()[2], 139.0);
        assert_abs_diff_eq!(c.data()[3], 154.0);
        assert!(a.matmul(&a).is_err());
    }

    #[test]
    fn test_relu_and_argmax() {
        let t: Tensor<f32> = Tensor::new(vec![-1.0, 3.0, 2.0, 0.5, -4.0, 9.0], vec![2, 3]).unwrap();
        assert_eq!(t.relu().data(), &[0.0, 3.0, 2.0, 0.5, 0.0, 9.0]);
        assert_eq!(t.argmax_rows().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_reshape() {
        let t: Tensor<f32> = Tensor::ones(vec![2, 8, 1, 1]);
        assert_eq!(t.reshape(vec![2, 8]).unwrap().shape_vec(), vec![2, 8]);
        assert!(t.reshape(vec![3, 5]).is_err());
        assert_eq!(t.into_reshape(vec![16]).unwrap().numel(), 16);
    }
}
