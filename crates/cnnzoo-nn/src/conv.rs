use cnnzoo_core::shape::nchw;
use cnnzoo_core::{Tensor, TensorError, TensorResult};
use rayon::prelude::*;

use crate::init;
use crate::layers::{Layer, Parameter};

/// Output extent of a sliding window along one spatial axis.
fn out_dim(input: usize, kernel: usize, stride: usize, padding: usize) -> TensorResult<usize> {
    let padded = input + 2 * padding;
    if padded < kernel || stride == 0 {
        return Err(TensorError::InvalidOperation(format!(
            "window of size {} (stride {}) does not fit an input extent of {} with padding {}",
            kernel, stride, input, padding
        )));
    }
    Ok((padded - kernel) / stride + 1)
}

/// Hyper-parameters of a [`Conv2d`] besides its channel counts and kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dOptions {
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub bias: bool,
}

impl Default for Conv2dOptions {
    fn default() -> Self {
        Conv2dOptions {
            stride: 1,
            padding: 0,
            groups: 1,
            bias: true,
        }
    }
}

impl Conv2dOptions {
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    pub fn groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }
}

/// 2D convolution with square kernels and optional channel grouping.
///
/// Input shape:  [batch, in_channels, height, width]
/// Output shape: [batch, out_channels, out_h, out_w]
///
/// With `groups = g`, input and output channels are split into `g` equal
/// partitions and output partition `i` only sees input partition `i`.
pub struct Conv2d {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
    pub groups: usize,
    pub weight: Parameter,       // [out_channels, in_channels / groups, k, k]
    pub bias: Option<Parameter>, // [out_channels]
}

impl Conv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize) -> Self {
        Self::with_options(in_channels, out_channels, kernel_size, Conv2dOptions::default())
    }

    /// # Panics
    ///
    /// If `groups` is zero or does not divide both channel counts.
    pub fn with_options(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        options: Conv2dOptions,
    ) -> Self {
        let Conv2dOptions { stride, padding, groups, bias } = options;
        assert!(
            groups > 0 && in_channels % groups == 0 && out_channels % groups == 0,
            "Conv2d: groups={} must divide in_channels={} and out_channels={}",
            groups,
            in_channels,
            out_channels
        );

        let fan_in = (in_channels / groups) * kernel_size * kernel_size;
        let weight = init::kaiming_uniform(
            vec![out_channels, in_channels / groups, kernel_size, kernel_size],
            fan_in,
        );
        let bias = bias
            .then(|| Parameter::new("bias", init::kaiming_uniform(vec![out_channels], fan_in)));

        Conv2d {
            in_channels,
            out_channels,
            kernel_size,
            stride,
            padding,
            groups,
            weight: Parameter::new("weight", weight),
            bias,
        }
    }

    fn check_channels(&self, channels: usize) -> TensorResult<()> {
        if channels != self.in_channels {
            return Err(TensorError::ChannelMismatch {
                layer: "Conv2d",
                expected: self.in_channels,
                got: channels,
            });
        }
        Ok(())
    }

    fn spatial_out(&self, h: usize, w: usize) -> TensorResult<(usize, usize)> {
        Ok((
            out_dim(h, self.kernel_size, self.stride, self.padding)?,
            out_dim(w, self.kernel_size, self.stride, self.padding)?,
        ))
    }
}

impl Layer for Conv2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let (batch, channels, h, w) = nchw(input.shape().dims())?;
        self.check_channels(channels)?;
        let (out_h, out_w) = self.spatial_out(h, w)?;

        let k = self.kernel_size;
        let (stride, pad) = (self.stride as isize, self.padding as isize);
        let in_per_group = self.in_channels / self.groups;
        let out_per_group = self.out_channels / self.groups;
        let out_plane = out_h * out_w;
        let in_image = channels * h * w;

        let x = input.data();
        let weights = self.weight.data.data();
        let bias = self.bias.as_ref().map(|b| b.data.data());

        let mut output = vec![0.0f32; batch * self.out_channels * out_plane];
        if output.is_empty() {
            return Tensor::new(output, vec![batch, self.out_channels, out_h, out_w]);
        }

        // Each image is independent; every output element accumulates in a
        // fixed order, so the result does not depend on thread scheduling.
        output
            .par_chunks_mut(self.out_channels * out_plane)
            .enumerate()
            .for_each(|(b, out_image)| {
                let x_image = &x[b * in_image..(b + 1) * in_image];
                for (oc, plane) in out_image.chunks_mut(out_plane).enumerate() {
                    plane.fill(bias.map_or(0.0, |bias| bias[oc]));
                    let group = oc / out_per_group;

                    for icg in 0..in_per_group {
                        let ic = group * in_per_group + icg;
                        let x_plane = &x_image[ic * h * w..(ic + 1) * h * w];
                        let w_base = (oc * in_per_group + icg) * k * k;

                        for kh in 0..k {
                            for kw in 0..k {
                                let wv = weights[w_base + kh * k + kw];
                                for oy in 0..out_h {
                                    let iy = oy as isize * stride + kh as isize - pad;
                                    if iy < 0 || iy >= h as isize {
                                        continue;
                                    }
                                    let x_row = &x_plane[iy as usize * w..(iy as usize + 1) * w];
                                    let out_row = &mut plane[oy * out_w..(oy + 1) * out_w];
                                    for (ox, o) in out_row.iter_mut().enumerate() {
                                        let ix = ox as isize * stride + kw as isize - pad;
                                        if ix >= 0 && ix < w as isize {
                                            *o += wv * x_row[ix as usize];
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            });

        Tensor::new(output, vec![batch, self.out_channels, out_h, out_w])
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let (batch, channels, h, w) = nchw(input)?;
        self.check_channels(channels)?;
        let (out_h, out_w) = self.spatial_out(h, w)?;
        Ok(vec![batch, self.out_channels, out_h, out_w])
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = vec![&self.weight];
        params.extend(self.bias.as_ref());
        params
    }

    fn describe(&self) -> String {
        format!(
            "Conv2d({}, {}, kernel_size={}, stride={}, padding={}, groups={}, bias={})",
            self.in_channels,
            self.out_channels,
            self.kernel_size,
            self.stride,
            self.padding,
            self.groups,
            self.bias.is_some()
        )
    }
}

/// Max Pooling 2D over non-padded windows.
pub struct MaxPool2d {
    pub kernel_size: usize,
    pub stride: usize,
}

impl MaxPool2d {
    /// Non-overlapping pooling: the stride equals the window.
    pub fn new(kernel_size: usize) -> Self {
        MaxPool2d { kernel_size, stride: kernel_size }
    }
}

impl Layer for MaxPool2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let shape = self.output_shape(input.shape().dims())?;
        let (_, _, h, w) = nchw(input.shape().dims())?;
        let (_, _, out_h, out_w) = nchw(&shape)?;
        let k = self.kernel_size;

        let mut output = Vec::with_capacity(shape.iter().product());
        for x_plane in input.data().chunks(h * w) {
            for oy in 0..out_h {
                for ox in 0..out_w {
                    let mut max_val = f32::NEG_INFINITY;
                    for kh in 0..k {
                        let row = (oy * self.stride + kh) * w;
                        for kw in 0..k {
                            max_val = max_val.max(x_plane[row + ox * self.stride + kw]);
                        }
                    }
                    output.push(max_val);
                }
            }
        }

        Tensor::new(output, shape)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let (batch, channels, h, w) = nchw(input)?;
        Ok(vec![
            batch,
            channels,
            out_dim(h, self.kernel_size, self.stride, 0)?,
            out_dim(w, self.kernel_size, self.stride, 0)?,
        ])
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![]
    }

    fn describe(&self) -> String {
        format!("MaxPool2d(kernel_size={}, stride={})", self.kernel_size, self.stride)
    }
}

/// Average pooling to a fixed output grid regardless of input size.
///
/// Output cell `(i, j)` averages rows `floor(i * H / oh) .. ceil((i + 1) * H / oh)`
/// and the analogous column range.
pub struct AdaptiveAvgPool2d {
    pub output_size: (usize, usize),
}

impl AdaptiveAvgPool2d {
    pub fn new(output_size: (usize, usize)) -> Self {
        AdaptiveAvgPool2d { output_size }
    }

    /// Pools every feature map down to 1x1.
    pub fn global() -> Self {
        Self::new((1, 1))
    }
}

fn bin(i: usize, input: usize, output: usize) -> (usize, usize) {
    let start = i * input / output;
    let end = ((i + 1) * input + output - 1) / output;
    (start, end)
}

impl Layer for AdaptiveAvgPool2d {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let shape = self.output_shape(input.shape().dims())?;
        let (_, _, h, w) = nchw(input.shape().dims())?;
        let (out_h, out_w) = self.output_size;

        let mut output = Vec::with_capacity(shape.iter().product());
        for x_plane in input.data().chunks(h * w) {
            for oy in 0..out_h {
                let (y0, y1) = bin(oy, h, out_h);
                for ox in 0..out_w {
                    let (x0, x1) = bin(ox, w, out_w);
                    let mut sum = 0.0f32;
                    for y in y0..y1 {
                        sum += x_plane[y * w + x0..y * w + x1].iter().sum::<f32>();
                    }
                    output.push(sum / ((y1 - y0) * (x1 - x0)) as f32);
                }
            }
        }

        Tensor::new(output, shape)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let (batch, channels, h, w) = nchw(input)?;
        let (out_h, out_w) = self.output_size;
        if h == 0 || w == 0 || out_h == 0 || out_w == 0 {
            return Err(TensorError::InvalidOperation(format!(
                "AdaptiveAvgPool2d: cannot pool a {}x{} map to {}x{}",
                h, w, out_h, out_w
            )));
        }
        Ok(vec![batch, channels, out_h, out_w])
    }

    fn parameters(&self) -> Vec<&Parameter> {
        vec![]
    }

    fn describe(&self) -> String {
        format!("AdaptiveAvgPool2d(output_size={:?})", self.output_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn arange(shape: Vec<usize>) -> Tensor<f32> {
        let n = shape.iter().product();
        Tensor::new((0..n).map(|i| i as f32).collect(), shape).unwrap()
    }

    #[test]
    fn test_conv2d_shapes() {
        let conv = Conv2d::new(1, 2, 3);
        let out = conv.forward(&arange(vec![1, 1, 4, 4])).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 2, 2, 2]); // (4-3)/1+1 = 2

        let same = Conv2d::with_options(1, 1, 3, Conv2dOptions::default().padding(1));
        assert_eq!(same.output_shape(&[3, 1, 4, 4]).unwrap(), vec![3, 1, 4, 4]);

        let strided = Conv2d::with_options(4, 8, 3, Conv2dOptions::default().stride(2).padding(1));
        assert_eq!(strided.output_shape(&[1, 4, 8, 8]).unwrap(), vec![1, 8, 4, 4]);
        assert_eq!(strided.output_shape(&[1, 4, 7, 7]).unwrap(), vec![1, 8, 4, 4]);
    }

    #[test]
    fn test_conv2d_known_values() {
        let mut conv = Conv2d::with_options(1, 1, 2, Conv2dOptions::default().bias(false));
        conv.weight.data = Tensor::ones(vec![1, 1, 2, 2]);
        let out = conv.forward(&arange(vec![1, 1, 3, 3])).unwrap();
        // window sums of [[0,1,2],[3,4,5],[6,7,8]]
        assert_eq!(out.data(), &[8.0, 12.0, 20.0, 24.0]);
    }

    #[test]
    fn test_conv2d_padding_and_bias() {
        let mut conv = Conv2d::with_options(1, 1, 3, Conv2dOptions::default().padding(1));
        conv.weight.data = Tensor::ones(vec![1, 1, 3, 3]);
        conv.bias.as_mut().unwrap().data = Tensor::full(vec![1], 0.5);
        let out = conv.forward(&Tensor::ones(vec![1, 1, 3, 3])).unwrap();
        // corners see 4 pixels, edges 6, centre 9
        assert_eq!(out.data(), &[4.5, 6.5, 4.5, 6.5, 9.5, 6.5, 4.5, 6.5, 4.5]);
    }

    #[test]
    fn test_grouped_conv_isolates_groups() {
        let options = Conv2dOptions::default().groups(2).bias(false);
        let mut conv = Conv2d::with_options(4, 4, 1, options);
        assert_eq!(conv.weight.data.shape_vec(), vec![4, 2, 1, 1]);
        conv.weight.data = Tensor::ones(vec![4, 2, 1, 1]);

        // channels 0,1 = 1.0 and channels 2,3 = 10.0
        let mut data = vec![1.0f32; 8];
        data.extend(vec![10.0f32; 8]);
        let x = Tensor::new(data, vec![1, 4, 2, 2]).unwrap();
        let out = conv.forward(&x).unwrap();

        assert!(out.data()[..8].iter().all(|&v| v == 2.0));
        assert!(out.data()[8..].iter().all(|&v| v == 20.0));
        assert_eq!(conv.num_parameters(), 4 * 2);
    }

    #[test]
    #[should_panic(expected = "groups=3")]
    fn test_grouped_conv_requires_divisible_channels() {
        Conv2d::with_options(4, 6, 3, Conv2dOptions::default().groups(3));
    }

    #[test]
    fn test_conv2d_channel_mismatch() {
        let conv = Conv2d::new(3, 8, 3);
        let err = conv.forward(&Tensor::zeros(vec![1, 4, 5, 5])).unwrap_err();
        assert_eq!(err, TensorError::ChannelMismatch { layer: "Conv2d", expected: 3, got: 4 });
    }

    #[test]
    fn test_conv2d_batch_is_independent() {
        let conv = Conv2d::with_options(2, 3, 3, Conv2dOptions::default().padding(1));
        let a: Tensor<f32> = Tensor::randn(vec![1, 2, 5, 5], Some(1));
        let b: Tensor<f32> = Tensor::randn(vec![1, 2, 5, 5], Some(2));
        let both = Tensor::new([a.data(), b.data()].concat(), vec![2, 2, 5, 5]).unwrap();

        let out = conv.forward(&both).unwrap();
        let out_b = conv.forward(&b).unwrap();
        assert_eq!(&out.data()[75..], out_b.data());
    }

    #[test]
    fn test_maxpool2d() {
        let pool = MaxPool2d::new(2);
        let out = pool.forward(&arange(vec![1, 1, 4, 4])).unwrap();
        assert_eq!(out.shape_vec(), vec![1, 1, 2, 2]);
        // Max of [0,1,4,5]=5, [2,3,6,7]=7, [8,9,12,13]=13, [10,11,14,15]=15
        assert_eq!(out.data(), &[5.0, 7.0, 13.0, 15.0]);
    }

    #[test]
    fn test_maxpool2d_too_small_input() {
        let pool = MaxPool2d::new(2);
        assert!(pool.output_shape(&[1, 8, 1, 1]).is_err());
        assert!(pool.forward(&Tensor::zeros(vec![1, 8, 1, 1])).is_err());
    }

    #[test]
    fn test_global_avg_pool() {
        let pool = AdaptiveAvgPool2d::global();
        let out = pool.forward(&arange(vec![2, 2, 2, 2])).unwrap();
        assert_eq!(out.shape_vec(), vec![2, 2, 1, 1]);
        assert_eq!(out.data(), &[1.5, 5.5, 9.5, 13.5]);
    }

    #[test]
    fn test_adaptive_avg_pool_uneven_bins() {
        let pool = AdaptiveAvgPool2d::new((2, 2));
        let out = pool.forward(&arange(vec![1, 1, 3, 3])).unwrap();
        // overlapping bins rows/cols 0..2 and 1..3
        assert_abs_diff_eq!(out.data()[0], 2.0);
        assert_abs_diff_eq!(out.data()[1], 3.0);
        assert_abs_diff_eq!(out.data()[2], 5.0);
        assert_abs_diff_eq!(out.data()[3], 6.0);
    }
}
