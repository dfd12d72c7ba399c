use cnnzoo_core::shape::nchw;
use cnnzoo_core::{Tensor, TensorError, TensorResult};
use parking_lot::RwLock;

use crate::init;

/// A named learnable tensor owned by a layer.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: &'static str,
    pub data: Tensor<f32>,
}

impl Parameter {
    pub fn new(name: &'static str, data: Tensor<f32>) -> Self {
        Parameter { name, data }
    }

    pub fn numel(&self) -> usize {
        self.data.numel()
    }
}

/// Trait for a neural network layer over `[N, ...]` batches of `f32`.
pub trait Layer: Send + Sync {
    /// Forward pass.
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>>;

    /// Shape produced by [`Layer::forward`] for an input of shape `input`,
    /// computed without touching any data.
    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>>;

    /// Return all trainable parameters.
    fn parameters(&self) -> Vec<&Parameter>;

    /// One-line description, e.g. `Conv2d(3, 64, kernel_size=3, ...)`.
    fn describe(&self) -> String;

    /// Direct sub-layers, for summaries.
    fn children(&self) -> Vec<&dyn Layer> {
        Vec::new()
    }

    fn set_training(&mut self, _training: bool) {}

    fn train(&mut self) {
        self.set_training(true);
    }

    fn eval(&mut self) {
        self.set_training(false);
    }

    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|p| p.numel()).sum()
    }
}

/// Fully connected layer: y = xW + b.
pub struct Linear {
    pub weight: Parameter, // [in_features, out_features]
    pub bias: Parameter,   // [1, out_features]
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Linear {
            weight: Parameter::new(
                "weight",
                init::kaiming_uniform(vec![in_features, out_features], in_features),
            ),
            bias: Parameter::new(
                "bias",
                init::kaiming_uniform(vec![1, out_features], in_features),
            ),
            in_features,
            out_features,
        }
    }

    fn check_input(&self, input: &[usize]) -> TensorResult<usize> {
        match *input {
            [batch, features] if features == self.in_features => Ok(batch),
            [_, features] => Err(TensorError::ChannelMismatch {
                layer: "Linear",
                expected: self.in_features,
                got: features,
            }),
            _ => Err(TensorError::DimensionMismatch(format!(
                "Linear expects a [N, {}] tensor, got shape {:?}",
                self.in_features, input
            ))),
        }
    }
}

impl Layer for Linear {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.check_input(input.shape().dims())?;
        input.matmul(&self.weight.data)?.add(&self.bias.data)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let batch = self.check_input(input)?;
        Ok(vec![batch, self.out_features])
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.weight, &self.bias]
    }

    fn describe(&self) -> String {
        format!(
            "Linear(in_features={}, out_features={})",
            self.in_features, self.out_features
        )
    }
}

/// ReLU activation layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU;

impl ReLU {
    pub fn new() -> Self {
        ReLU
    }
}

impl Layer for ReLU {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        Ok(input.relu())
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        Ok(input.to_vec())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![]
    }

    fn describe(&self) -> String {
        "ReLU()".to_string()
    }
}

/// Flatten layer: reshapes `[N, d1, d2, ...]` to `[N, d1 * d2 * ...]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Flatten;

impl Flatten {
    pub fn new() -> Self {
        Flatten
    }
}

impl Layer for Flatten {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let shape = self.output_shape(input.shape().dims())?;
        input.reshape(shape)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        match input.split_first() {
            Some((&batch, rest)) => Ok(vec![batch, rest.iter().product()]),
            None => Err(TensorError::InvalidOperation(
                "Flatten requires at least one dimension".to_string(),
            )),
        }
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![]
    }

    fn describe(&self) -> String {
        "Flatten()".to_string()
    }
}

/// Batch normalization over the channel axis of `[N, C, H, W]` inputs.
///
/// y = (x - mean) / sqrt(var + eps) * gamma + beta
///
/// In training mode the statistics come from the batch and the running
/// estimates are updated with `momentum`; in eval mode the running estimates
/// are used and the forward pass is a pure function of its input.
pub struct BatchNorm2d {
    pub num_features: usize,
    pub eps: f32,
    pub momentum: f32,
    pub gamma: Parameter,
    pub beta: Parameter,
    running_mean: RwLock<Vec<f32>>,
    running_var: RwLock<Vec<f32>>,
    training: bool,
}

impl BatchNorm2d {
    pub fn new(num_features: usize) -> Self {
        Self::with_options(num_features, 1e-5, 0.1)
    }

    pub fn with_options(num_features: usize, eps: f32, momentum: f32) -> Self {
        BatchNorm2d {
            num_features,
            eps,
            momentum,
            gamma: Parameter::new("weight", Tensor::ones(vec![num_features])),
            beta: Parameter::new("bias", Tensor::zeros(vec![num_features])),
            running_mean: RwLock::new(vec![0.0; num_features]),
            running_var: RwLock::new(vec![1.0; num_features]),
            training: true,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn running_mean(&self) -> Vec<f32> {
        self.running_mean.read().clone()
    }

    pub fn running_var(&self) -> Vec<f32> {
        self.running_var.read().clone()
    }

    /// Per-channel biased mean and variance over batch and spatial axes.
    fn batch_statistics(&self, x: &[f32], n: usize, plane: usize) -> (Vec<f32>, Vec<f32>) {
        let c = self.num_features;
        let count = (n * plane) as f64;
        let mut means = vec![0.0f32; c];
        let mut vars = vec![0.0f32; c];

        for ch in 0..c {
            let planes = || (0..n).map(move |b| &x[(b * c + ch) * plane..(b * c + ch + 1) * plane]);
            let sum: f64 = planes().flatten().map(|&v| v as f64).sum();
            let mean = sum / count;
            let sq: f64 = planes()
                .flatten()
                .map(|&v| (v as f64 - mean).powi(2))
                .sum();
            means[ch] = mean as f32;
            vars[ch] = (sq / count) as f32;
        }
        (means, vars)
    }
}

impl Layer for BatchNorm2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (n, c, h, w) = nchw(input.shape().dims())?;
        if c != self.num_features {
            return Err(TensorError::ChannelMismatch {
                layer: "BatchNorm2d",
                expected: self.num_features,
                got: c,
            });
        }
        let plane = h * w;

        let (means, vars) = if self.training {
            let count = n * plane;
            if count < 2 {
                return Err(TensorError::InvalidOperation(format!(
                    "BatchNorm2d: expected more than 1 value per channel when training, got input shape {:?}",
                    input.shape().dims()
                )));
            }
            let (means, vars) = self.batch_statistics(input.data(), n, plane);

            let unbias = count as f32 / (count - 1) as f32;
            let mut rm = self.running_mean.write();
            let mut rv = self.running_var.write();
            for ch in 0..c {
                rm[ch] = (1.0 - self.momentum) * rm[ch] + self.momentum * means[ch];
                rv[ch] = (1.0 - self.momentum) * rv[ch] + self.momentum * vars[ch] * unbias;
            }
            (means, vars)
        } else {
            (self.running_mean(), self.running_var())
        };

        let gamma = self.gamma.data.data();
        let beta = self.beta.data.data();
        let scale: Vec<f32> = (0..c)
            .map(|ch| gamma[ch] / (vars[ch] + self.eps).sqrt())
            .collect();
        let shift: Vec<f32> = (0..c).map(|ch| beta[ch] - means[ch] * scale[ch]).collect();

        let mut output = input.clone();
        for (i, channel_plane) in output.data_mut().chunks_mut(plane.max(1)).enumerate() {
            let ch = i % c;
            for v in channel_plane {
                *v = *v * scale[ch] + shift[ch];
            }
        }
        Ok(output)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let (_, c, _, _) = nchw(input)?;
        if c != self.num_features {
            return Err(TensorError::ChannelMismatch {
                layer: "BatchNorm2d",
                expected: self.num_features,
                got: c,
            });
        }
        Ok(input.to_vec())
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![&self.gamma, &self.beta]
    }

    fn describe(&self) -> String {
        format!(
            "BatchNorm2d({}, eps={}, momentum={})",
            self.num_features, self.eps, self.momentum
        )
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_linear_shapes() {
        let fc = Linear::new(8, 3);
        let x: Tensor<f32> = Tensor::rand(vec![5, 8], Some(0));
        let y = fc.forward(&x).unwrap();
        assert_eq!(y.shape_vec(), vec![5, 3]);
        assert_eq!(fc.output_shape(&[5, 8]).unwrap(), vec![5, 3]);
        assert_eq!(fc.num_parameters(), 8 * 3 + 3);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let fc = Linear::new(8, 3);
        let x: Tensor<f32> = Tensor::zeros(vec![2, 7]);
        assert_eq!(
            fc.forward(&x).unwrap_err(),
            TensorError::ChannelMismatch { layer: "Linear", expected: 8, got: 7 }
        );
        assert!(fc.output_shape(&[2, 8, 1, 1]).is_err());
    }

    #[test]
    fn test_flatten() {
        let x: Tensor<f32> = Tensor::ones(vec![2, 16, 1, 1]);
        let y = Flatten.forward(&x).unwrap();
        assert_eq!(y.shape_vec(), vec![2, 16]);
    }

    #[test]
    fn test_batchnorm_training_normalizes() {
        let mut bn = BatchNorm2d::new(2);
        bn.train();
        // channel 0 holds 0..8, channel 1 holds a constant
        let mut data = Vec::new();
        for b in 0..2 {
            data.extend((0..4).map(|i| (b * 4 + i) as f32));
            data.extend([3.0f32; 4]);
        }
        let x = Tensor::new(data, vec![2, 2, 2, 2]).unwrap();
        let y = bn.forward(&x).unwrap();

        let ch0: Vec<f32> = [&y.data()[0..4], &y.data()[8..12]].concat();
        let mean: f32 = ch0.iter().sum::<f32>() / 8.0;
        let var: f32 = ch0.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 8.0;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-3);
        assert!(y.data()[4..8].iter().all(|v| v.abs() < 1e-5));

        // running mean moved 10% towards the batch mean of 3.5
        assert_abs_diff_eq!(bn.running_mean()[0], 0.35, epsilon = 1e-6);
        assert_abs_diff_eq!(bn.running_mean()[1], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn test_batchnorm_eval_uses_running_stats() {
        let mut bn = BatchNorm2d::new(3);
        bn.eval();
        let x: Tensor<f32> = Tensor::randn(vec![1, 3, 2, 2], Some(3));
        let y = bn.forward(&x).unwrap();
        // fresh running stats: mean 0, var 1
        for (a, b) in x.data().iter().zip(y.data()) {
            assert_abs_diff_eq!(*a / (1.0f32 + 1e-5).sqrt(), *b, epsilon = 1e-6);
        }
        assert_eq!(bn.running_mean(), vec![0.0; 3]);
    }

    #[test]
    fn test_batchnorm_single_value_in_training_is_error() {
        let bn = BatchNorm2d::new(4);
        let x: Tensor<f32> = Tensor::ones(vec![1, 4, 1, 1]);
        assert!(matches!(bn.forward(&x), Err(TensorError::InvalidOperation(_))));
    }

    #[test]
    fn test_batchnorm_channel_mismatch() {
        let mut bn = BatchNorm2d::new(4);
        bn.eval();
        let x: Tensor<f32> = Tensor::ones(vec![1, 3, 2, 2]);
        assert!(matches!(
            bn.forward(&x),
            Err(TensorError::ChannelMismatch { expected: 4, got: 3, .. })
        ));
    }
}
