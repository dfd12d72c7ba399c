//! VGG - Very Deep Convolutional Networks, with batch normalization.
//!
//! A VGG network is fully described by an ordered list of stages: a channel
//! width inserts a 3x3 convolution block, a pool marker halves the spatial
//! resolution. The feature stack ends in a [`ClassifierHead`].
//!
//! "Very Deep Convolutional Networks for Large-Scale Image Recognition"
//! (Simonyan & Zisserman, 2014) <https://arxiv.org/abs/1409.1556>

use cnnzoo_core::{Tensor, TensorResult};
use cnnzoo_nn::{BatchNorm2d, Conv2d, Conv2dOptions, Layer, MaxPool2d, Parameter, ReLU, Sequential};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ModelError;
use crate::head::ClassifierHead;
use crate::{DEFAULT_NUM_CLASSES, IMAGE_CHANNELS};

// =============================================================================
// Stage specification
// =============================================================================

/// One entry of a VGG stage list.
///
/// Serialized the conventional way: a width is a bare integer and a pool
/// marker is the string `"M"`, so `[64, "M", 128, "M"]` is a valid list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawStage", into = "RawStage")]
pub enum VggStage {
    /// 3x3 convolution block producing this many channels.
    Conv(usize),
    /// 2x2 max pool with stride 2.
    Pool,
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawStage {
    Width(usize),
    Marker(String),
}

const POOL_MARKER: &str = "M";

impl TryFrom<RawStage> for VggStage {
    type Error = ModelError;

    fn try_from(raw: RawStage) -> Result<Self, Self::Error> {
        match raw {
            RawStage::Width(w) => Ok(VggStage::Conv(w)),
            RawStage::Marker(m) if m == POOL_MARKER => Ok(VggStage::Pool),
            RawStage::Marker(m) => Err(ModelError::InvalidStage(m)),
        }
    }
}

impl From<VggStage> for RawStage {
    fn from(stage: VggStage) -> Self {
        match stage {
            VggStage::Conv(w) => RawStage::Width(w),
            VggStage::Pool => RawStage::Marker(POOL_MARKER.to_string()),
        }
    }
}

const M: VggStage = VggStage::Pool;

const fn c(width: usize) -> VggStage {
    VggStage::Conv(width)
}

#[rustfmt::skip]
pub const VGG11_STAGES: &[VggStage] = &[
    c(64), M,
    c(128), M,
    c(256), c(256), M,
    c(512), c(512), M,
    c(512), c(512), M,
];

#[rustfmt::skip]
pub const VGG13_STAGES: &[VggStage] = &[
    c(64), c(64), M,
    c(128), c(128), M,
    c(256), c(256), M,
    c(512), c(512), M,
    c(512), c(512), M,
];

#[rustfmt::skip]
pub const VGG16_STAGES: &[VggStage] = &[
    c(64), c(64), M,
    c(128), c(128), M,
    c(256), c(256), c(256), M,
    c(512), c(512), c(512), M,
    c(512), c(512), c(512), M,
];

#[rustfmt::skip]
pub const VGG19_STAGES: &[VggStage] = &[
    c(64), c(64), M,
    c(128), c(128), M,
    c(256), c(256), c(256), c(256), M,
    c(512), c(512), c(512), c(512), M,
    c(512), c(512), c(512), c(512), M,
];

fn default_image_channels() -> usize {
    IMAGE_CHANNELS
}

fn default_num_classes() -> usize {
    DEFAULT_NUM_CLASSES
}

/// Everything needed to build a [`Vgg`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VggConfig {
    pub stages: Vec<VggStage>,
    #[serde(default = "default_image_channels")]
    pub image_channels: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl VggConfig {
    pub fn new(stages: &[VggStage]) -> Self {
        VggConfig {
            stages: stages.to_vec(),
            image_channels: IMAGE_CHANNELS,
            num_classes: DEFAULT_NUM_CLASSES,
        }
    }

    pub fn vgg11() -> Self {
        Self::new(VGG11_STAGES)
    }

    pub fn vgg13() -> Self {
        Self::new(VGG13_STAGES)
    }

    pub fn vgg16() -> Self {
        Self::new(VGG16_STAGES)
    }

    pub fn vgg19() -> Self {
        Self::new(VGG19_STAGES)
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Channel count leaving the feature stack: the last declared width, or
    /// the image channels when the list declares none.
    pub fn out_channels(&self) -> usize {
        self.stages
            .iter()
            .rev()
            .find_map(|s| match *s {
                VggStage::Conv(w) => Some(w),
                VggStage::Pool => None,
            })
            .unwrap_or(self.image_channels)
    }

    pub fn num_convs(&self) -> usize {
        self.stages.iter().filter(|s| matches!(s, VggStage::Conv(_))).count()
    }

    pub fn num_pools(&self) -> usize {
        self.stages.len() - self.num_convs()
    }
}

// =============================================================================
// Conv block
// =============================================================================

/// conv3x3 (stride 1, padding 1) -> BN -> ReLU
pub struct ConvBlock {
    conv: Conv2d,
    bn: BatchNorm2d,
    relu: ReLU,
}

impl ConvBlock {
    pub fn new(in_channels: usize, out_channels: usize) -> Self {
        ConvBlock {
            conv: Conv2d::with_options(
                in_channels,
                out_channels,
                3,
                Conv2dOptions::default().padding(1),
            ),
            bn: BatchNorm2d::new(out_channels),
            relu: ReLU,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.conv.out_channels
    }
}

impl Layer for ConvBlock {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let x = self.conv.forward(input)?;
        let x = self.bn.forward(&x)?;
        self.relu.forward(&x)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let shape = self.conv.output_shape(input)?;
        self.bn.output_shape(&shape)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.conv.parameters();
        params.extend(self.bn.parameters());
        params
    }

    fn describe(&self) -> String {
        format!("ConvBlock({}, {})", self.in_channels(), self.out_channels())
    }

    fn children(&self) -> Vec<&dyn Layer> {
        vec![&self.conv as &dyn Layer, &self.bn, &self.relu]
    }

    fn set_training(&mut self, training: bool) {
        self.bn.set_training(training);
    }
}

/// Expand a stage list into a feature stack.
///
/// Returns the stack together with the channel count it produces, which is
/// what the classifier must accept.
pub fn build_features(stages: &[VggStage], in_channels: usize) -> (Sequential, usize) {
    debug!(stages = stages.len(), in_channels, "building VGG feature stack");
    stages.iter().fold(
        (Sequential::new(), in_channels),
        |(mut features, channels), stage| match *stage {
            VggStage::Pool => {
                features.push(MaxPool2d::new(2));
                (features, channels)
            }
            VggStage::Conv(width) => {
                features.push(ConvBlock::new(channels, width));
                (features, width)
            }
        },
    )
}

// =============================================================================
// VGG
// =============================================================================

pub struct Vgg {
    config: VggConfig,
    features: Sequential,
    head: ClassifierHead,
}

impl Vgg {
    pub fn new(config: &VggConfig) -> Self {
        let (features, out_channels) = build_features(&config.stages, config.image_channels);
        let head = ClassifierHead::new(out_channels, config.num_classes);

        let vgg = Vgg {
            config: config.clone(),
            features,
            head,
        };
        debug!(
            convs = config.num_convs(),
            pools = config.num_pools(),
            out_channels,
            parameters = vgg.num_parameters(),
            "built VGG"
        );
        vgg
    }

    pub fn config(&self) -> &VggConfig {
        &self.config
    }

    pub fn features(&self) -> &Sequential {
        &self.features
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }
}

impl Layer for Vgg {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let x = self.features.forward(input)?;
        self.head.forward(&x)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let shape = self.features.output_shape(input)?;
        self.head.output_shape(&shape)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.features.parameters();
        params.extend(self.head.parameters());
        params
    }

    fn describe(&self) -> String {
        format!(
            "VGG(convs={}, pools={}, num_classes={})",
            self.config.num_convs(),
            self.config.num_pools(),
            self.num_classes()
        )
    }

    fn children(&self) -> Vec<&dyn Layer> {
        vec![&self.features as &dyn Layer, &self.head]
    }

    fn set_training(&mut self, training: bool) {
        self.features.set_training(training);
    }
}

pub fn vgg11() -> Vgg {
    Vgg::new(&VggConfig::vgg11())
}

pub fn vgg13() -> Vgg {
    Vgg::new(&VggConfig::vgg13())
}

pub fn vgg16() -> Vgg {
    Vgg::new(&VggConfig::vgg16())
}

pub fn vgg19() -> Vgg {
    Vgg::new(&VggConfig::vgg19())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cnnzoo_core::TensorError;

    fn tiny() -> VggConfig {
        VggConfig::new(&[c(4), M, c(8), c(6), M]).with_num_classes(3)
    }

    #[test]
    fn test_vgg11_parameter_count() {
        let net = vgg11();
        assert_eq!(net.num_parameters(), 9_231_114);
        assert_eq!(net.head().in_features(), 512);
    }

    #[test]
    fn test_preset_depths() {
        for (cfg, convs) in [
            (VggConfig::vgg11(), 8),
            (VggConfig::vgg13(), 10),
            (VggConfig::vgg16(), 13),
            (VggConfig::vgg19(), 16),
        ] {
            assert_eq!(cfg.num_convs(), convs);
            assert_eq!(cfg.num_pools(), 5);
            assert_eq!(cfg.out_channels(), 512);
        }
    }

    #[test]
    fn test_vgg11_shapes_on_cifar_input() {
        let net = vgg11();
        for n in [1, 2, 7] {
            assert_eq!(net.output_shape(&[n, 3, 32, 32]).unwrap(), vec![n, 10]);
        }
        // five pools take 32x32 down to 1x1 with 512 channels
        assert_eq!(net.features().output_shape(&[1, 3, 32, 32]).unwrap(), vec![1, 512, 1, 1]);
    }

    #[test]
    fn test_each_pool_halves_resolution() {
        let with_two = VggConfig::new(&[c(8), M, c(16), M]);
        let with_one = VggConfig::new(&[c(8), M, c(16)]);
        let (two, two_out) = build_features(&with_two.stages, 3);
        let (one, one_out) = build_features(&with_one.stages, 3);

        assert_eq!(two_out, 16);
        assert_eq!(one_out, 16);
        assert_eq!(two.output_shape(&[1, 3, 16, 16]).unwrap(), vec![1, 16, 4, 4]);
        assert_eq!(one.output_shape(&[1, 3, 16, 16]).unwrap(), vec![1, 16, 8, 8]);
    }

    #[test]
    fn test_flatten_width_matches_last_conv() {
        let net = Vgg::new(&tiny());
        assert_eq!(net.head().in_features(), 6);
        assert_eq!(net.config().out_channels(), 6);
    }

    #[test]
    fn test_tiny_forward() {
        let mut net = Vgg::new(&tiny());
        net.eval();
        for n in [1, 3] {
            let x: Tensor<f32> = Tensor::randn(vec![n, 3, 8, 8], Some(n as u64));
            let y = net.forward(&x).unwrap();
            assert_eq!(y.shape_vec(), vec![n, 3]);
            assert!(!y.has_nan());
        }
    }

    #[test]
    fn test_forward_is_deterministic_in_eval() {
        let mut net = Vgg::new(&tiny());
        net.eval();
        let x: Tensor<f32> = Tensor::randn(vec![2, 3, 8, 8], Some(11));
        let a = net.forward(&x).unwrap();
        let b = net.forward(&x).unwrap();
        assert_eq!(a.data(), b.data());
    }

    #[test]
    fn test_training_mode_forward() {
        let mut net = Vgg::new(&tiny());
        net.train();
        let x: Tensor<f32> = Tensor::randn(vec![2, 3, 8, 8], Some(4));
        assert_eq!(net.forward(&x).unwrap().shape_vec(), vec![2, 3]);
    }

    #[test]
    fn test_no_conv_stages_feed_image_channels_to_head() {
        let net = Vgg::new(&VggConfig::new(&[M]));
        assert_eq!(net.head().in_features(), 3);
        assert_eq!(net.output_shape(&[2, 3, 4, 4]).unwrap(), vec![2, 10]);
    }

    #[test]
    fn test_wrong_input_channels_surface_as_tensor_error() {
        let net = Vgg::new(&tiny());
        assert!(matches!(
            net.output_shape(&[1, 1, 8, 8]),
            Err(TensorError::ChannelMismatch { layer: "Conv2d", expected: 3, got: 1 })
        ));
    }

    #[test]
    fn test_too_many_pools_for_input() {
        let net = vgg11();
        assert!(net.output_shape(&[1, 3, 16, 16]).is_err());
    }

    #[test]
    fn test_stage_list_serde() {
        let cfg: VggConfig = serde_json::from_str(r#"{"stages": [64, "M", 128, "M"]}"#).unwrap();
        assert_eq!(cfg.stages, vec![c(64), M, c(128), M]);
        assert_eq!(cfg.image_channels, 3);
        assert_eq!(cfg.num_classes, 10);

        let json = serde_json::to_string(&VggConfig::vgg11().stages).unwrap();
        assert!(json.starts_with(r#"[64,"M",128,"M",256,256"#));

        let bad = serde_json::from_str::<VggConfig>(r#"{"stages": [64, "P"]}"#);
        assert!(bad.is_err());
    }
}
