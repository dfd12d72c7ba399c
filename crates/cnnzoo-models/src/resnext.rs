//! ResNeXt - aggregated residual transformations.
//!
//! A stem convolution, four stages of grouped-convolution bottlenecks and a
//! [`ClassifierHead`]. Block layout is planned up front by
//! [`ResNeXtConfig::plan`], a pure function of the configuration, and then
//! materialized into layers; the two always agree.
//!
//! "Aggregated Residual Transformations for Deep Neural Networks"
//! (Xie et al., 2016) <https://arxiv.org/abs/1611.05431>

use cnnzoo_core::{Tensor, TensorResult};
use cnnzoo_nn::{BatchNorm2d, Conv2d, Conv2dOptions, Layer, Parameter, ReLU, Sequential};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::head::ClassifierHead;
use crate::{DEFAULT_NUM_CLASSES, IMAGE_CHANNELS};

/// Stride of the first block of each stage. Stage 1 keeps the stem
/// resolution, every later stage halves it.
pub const STAGE_STRIDES: [usize; 4] = [1, 2, 2, 2];

// =============================================================================
// Block planning
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutKind {
    Identity,
    /// 1x1 convolution (carrying the block stride) + BN.
    Projection,
}

impl ShortcutKind {
    pub fn for_block(in_channels: usize, out_channels: usize, stride: usize) -> Self {
        if stride != 1 || in_channels != out_channels {
            ShortcutKind::Projection
        } else {
            ShortcutKind::Identity
        }
    }
}

/// Channel and stride layout of a single bottleneck.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BottleneckSpec {
    pub in_channels: usize,
    /// `groups * bottleneck_width`, the width of the grouped 3x3 conv.
    pub inner_channels: usize,
    pub out_channels: usize,
    pub groups: usize,
    pub stride: usize,
    pub shortcut: ShortcutKind,
}

impl BottleneckSpec {
    pub fn new(in_channels: usize, bottleneck_width: usize, groups: usize, stride: usize) -> Self {
        let inner_channels = groups * bottleneck_width;
        let out_channels = Bottleneck::EXPANSION * inner_channels;
        BottleneckSpec {
            in_channels,
            inner_channels,
            out_channels,
            groups,
            stride,
            shortcut: ShortcutKind::for_block(in_channels, out_channels, stride),
        }
    }
}

/// What carries over from one stage to the next while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageState {
    pub in_channels: usize,
    pub bottleneck_width: usize,
}

/// Plan one stage: `num_blocks` bottlenecks, the first with `stride`, the rest
/// with stride 1, each consuming the previous block's output channels.
///
/// The bottleneck width of the returned state is doubled whether or not the
/// stage contains any blocks.
pub fn plan_stage(
    state: StageState,
    groups: usize,
    num_blocks: usize,
    stride: usize,
) -> (Vec<BottleneckSpec>, StageState) {
    let mut in_channels = state.in_channels;
    let blocks = (0..num_blocks)
        .map(|i| {
            let block_stride = if i == 0 { stride } else { 1 };
            let spec =
                BottleneckSpec::new(in_channels, state.bottleneck_width, groups, block_stride);
            in_channels = spec.out_channels;
            spec
        })
        .collect();

    let next = StageState {
        in_channels,
        bottleneck_width: state.bottleneck_width * 2,
    };
    (blocks, next)
}

// =============================================================================
// Configuration
// =============================================================================

fn default_image_channels() -> usize {
    IMAGE_CHANNELS
}

fn default_num_classes() -> usize {
    DEFAULT_NUM_CLASSES
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResNeXtConfig {
    /// Output channels of the stem, and input channels of stage 1.
    #[serde(alias = "in_C")]
    pub stem_channels: usize,
    /// Cardinality: parallel paths inside each grouped 3x3 conv.
    pub groups: usize,
    /// Per-group width of the first stage; doubles after every stage.
    pub bottleneck_width: usize,
    pub num_blocks: [usize; 4],
    #[serde(default = "default_image_channels")]
    pub image_channels: usize,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

impl ResNeXtConfig {
    pub fn new(
        stem_channels: usize,
        groups: usize,
        bottleneck_width: usize,
        num_blocks: [usize; 4],
    ) -> Self {
        ResNeXtConfig {
            stem_channels,
            groups,
            bottleneck_width,
            num_blocks,
            image_channels: IMAGE_CHANNELS,
            num_classes: DEFAULT_NUM_CLASSES,
        }
    }

    /// ResNeXt50 (2x32d): `[3, 4, 6, 3]` blocks, cardinality 2, width 32.
    pub fn resnext50_2x32d() -> Self {
        Self::new(32, 2, 32, [3, 4, 6, 3])
    }

    pub fn with_num_classes(mut self, num_classes: usize) -> Self {
        self.num_classes = num_classes;
        self
    }

    /// Block layout of all four stages.
    pub fn plan(&self) -> [Vec<BottleneckSpec>; 4] {
        let mut state = StageState {
            in_channels: self.stem_channels,
            bottleneck_width: self.bottleneck_width,
        };
        std::array::from_fn(|i| {
            let (blocks, next) =
                plan_stage(state, self.groups, self.num_blocks[i], STAGE_STRIDES[i]);
            state = next;
            blocks
        })
    }

    /// Channels reaching the classifier.
    pub fn out_channels(&self) -> usize {
        self.plan()
            .iter()
            .flatten()
            .last()
            .map_or(self.stem_channels, |b| b.out_channels)
    }

    /// Bottleneck width used by the last stage, i.e. `bottleneck_width * 8`.
    pub fn final_bottleneck_width(&self) -> usize {
        self.bottleneck_width << (STAGE_STRIDES.len() - 1)
    }

    pub fn total_blocks(&self) -> usize {
        self.num_blocks.iter().sum()
    }
}

// =============================================================================
// Layers
// =============================================================================

pub enum Shortcut {
    Identity,
    Projection { conv: Conv2d, bn: BatchNorm2d },
}

impl Shortcut {
    fn new(spec: &BottleneckSpec) -> Self {
        match spec.shortcut {
            ShortcutKind::Identity => Shortcut::Identity,
            ShortcutKind::Projection => Shortcut::Projection {
                conv: Conv2d::with_options(
                    spec.in_channels,
                    spec.out_channels,
                    1,
                    Conv2dOptions::default().stride(spec.stride).bias(false),
                ),
                bn: BatchNorm2d::new(spec.out_channels),
            },
        }
    }

    pub fn kind(&self) -> ShortcutKind {
        match self {
            Shortcut::Identity => ShortcutKind::Identity,
            Shortcut::Projection { .. } => ShortcutKind::Projection,
        }
    }

    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        match self {
            Shortcut::Identity => Ok(input.clone()),
            Shortcut::Projection { conv, bn } => bn.forward(&conv.forward(input)?),
        }
    }
}

/// ResNeXt bottleneck block.
///
/// conv1x1 -> BN -> ReLU -> grouped conv3x3 (stride) -> BN -> ReLU
/// -> conv1x1 (x EXPANSION) -> BN, then `relu(main + shortcut(x))`.
/// No convolution in the block carries a bias.
pub struct Bottleneck {
    spec: BottleneckSpec,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    conv3: Conv2d,
    bn3: BatchNorm2d,
    relu: ReLU,
    shortcut: Shortcut,
}

impl Bottleneck {
    pub const EXPANSION: usize = 2;

    pub fn new(in_channels: usize, bottleneck_width: usize, groups: usize, stride: usize) -> Self {
        Self::from_spec(&BottleneckSpec::new(in_channels, bottleneck_width, groups, stride))
    }

    pub fn from_spec(spec: &BottleneckSpec) -> Self {
        let no_bias = Conv2dOptions::default().bias(false);
        let inner = spec.inner_channels;
        Bottleneck {
            spec: *spec,
            conv1: Conv2d::with_options(spec.in_channels, inner, 1, no_bias),
            bn1: BatchNorm2d::new(inner),
            conv2: Conv2d::with_options(
                inner,
                inner,
                3,
                no_bias.stride(spec.stride).padding(1).groups(spec.groups),
            ),
            bn2: BatchNorm2d::new(inner),
            conv3: Conv2d::with_options(inner, spec.out_channels, 1, no_bias),
            bn3: BatchNorm2d::new(spec.out_channels),
            relu: ReLU,
            shortcut: Shortcut::new(spec),
        }
    }

    pub fn spec(&self) -> &BottleneckSpec {
        &self.spec
    }

    pub fn shortcut(&self) -> &Shortcut {
        &self.shortcut
    }
}

impl Layer for Bottleneck {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let out = self.relu.forward(&self.bn1.forward(&self.conv1.forward(input)?)?)?;
        let out = self.relu.forward(&self.bn2.forward(&self.conv2.forward(&out)?)?)?;
        let mut out = self.bn3.forward(&self.conv3.forward(&out)?)?;

        out.add_assign(&self.shortcut.forward(input)?)?;
        out.apply_mut(|v| v.max(0.0));
        Ok(out)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let shape = self.conv1.output_shape(input)?;
        let shape = self.conv2.output_shape(&shape)?;
        self.conv3.output_shape(&shape)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = Vec::new();
        let conv_bn = [
            (&self.conv1, &self.bn1),
            (&self.conv2, &self.bn2),
            (&self.conv3, &self.bn3),
        ];
        for (conv, bn) in conv_bn {
            params.extend(conv.parameters());
            params.extend(bn.parameters());
        }
        if let Shortcut::Projection { conv, bn } = &self.shortcut {
            params.extend(conv.parameters());
            params.extend(bn.parameters());
        }
        params
    }

    fn describe(&self) -> String {
        format!(
            "Bottleneck({} -> {} -> {}, groups={}, stride={}, shortcut={:?})",
            self.spec.in_channels,
            self.spec.inner_channels,
            self.spec.out_channels,
            self.spec.groups,
            self.spec.stride,
            self.spec.shortcut
        )
    }

    fn children(&self) -> Vec<&dyn Layer> {
        let mut children: Vec<&dyn Layer> = vec![
            &self.conv1, &self.bn1, &self.conv2, &self.bn2, &self.conv3, &self.bn3,
        ];
        if let Shortcut::Projection { conv, bn } = &self.shortcut {
            children.push(conv);
            children.push(bn);
        }
        children
    }

    fn set_training(&mut self, training: bool) {
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        self.bn3.set_training(training);
        if let Shortcut::Projection { bn, .. } = &mut self.shortcut {
            bn.set_training(training);
        }
    }
}

/// conv3x3 (stride 1, padding 1, no bias) -> BN -> ReLU
fn build_stem(image_channels: usize, stem_channels: usize) -> Sequential {
    Sequential::new()
        .add(Box::new(Conv2d::with_options(
            image_channels,
            stem_channels,
            3,
            Conv2dOptions::default().padding(1).bias(false),
        )))
        .add(Box::new(BatchNorm2d::new(stem_channels)))
        .add(Box::new(ReLU))
}

/// Materialize a planned stage. An empty plan yields an empty stack, which
/// passes its input through.
pub fn build_stage(blocks: &[BottleneckSpec]) -> Sequential {
    if let (Some(first), Some(last)) = (blocks.first(), blocks.last()) {
        debug!(
            blocks = blocks.len(),
            in_channels = first.in_channels,
            out_channels = last.out_channels,
            stride = first.stride,
            "building ResNeXt stage"
        );
    }
    blocks.iter().fold(Sequential::new(), |stage, spec| {
        stage.add(Box::new(Bottleneck::from_spec(spec)))
    })
}

// =============================================================================
// ResNeXt
// =============================================================================

pub struct ResNeXt {
    config: ResNeXtConfig,
    stem: Sequential,
    stages: [Sequential; 4],
    head: ClassifierHead,
}

impl ResNeXt {
    /// # Panics
    ///
    /// If `groups` is zero.
    pub fn new(config: &ResNeXtConfig) -> Self {
        let plan = config.plan();
        let stem = build_stem(config.image_channels, config.stem_channels);
        let stages = std::array::from_fn(|i| build_stage(&plan[i]));
        let out_channels = config.out_channels();
        let head = ClassifierHead::new(out_channels, config.num_classes);

        let net = ResNeXt {
            config: config.clone(),
            stem,
            stages,
            head,
        };
        debug!(
            blocks = config.total_blocks(),
            groups = config.groups,
            out_channels,
            parameters = net.num_parameters(),
            "built ResNeXt"
        );
        net
    }

    pub fn config(&self) -> &ResNeXtConfig {
        &self.config
    }

    pub fn stages(&self) -> &[Sequential; 4] {
        &self.stages
    }

    pub fn head(&self) -> &ClassifierHead {
        &self.head
    }

    pub fn num_blocks(&self) -> usize {
        self.stages.iter().map(Sequential::len).sum()
    }

    pub fn num_classes(&self) -> usize {
        self.head.num_classes()
    }
}

impl Layer for ResNeXt {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut x = self.stem.forward(input)?;
        for (i, stage) in self.stages.iter().enumerate() {
            x = stage.forward(&x)?;
            debug!(stage = i + 1, shape = ?x.shape_vec(), "stage output");
        }
        self.head.forward(&x)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let shape = self.stem.output_shape(input)?;
        let shape = self
            .stages
            .iter()
            .try_fold(shape, |shape, stage| stage.output_shape(&shape))?;
        self.head.output_shape(&shape)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        let mut params = self.stem.parameters();
        for stage in &self.stages {
            params.extend(stage.parameters());
        }
        params.extend(self.head.parameters());
        params
    }

    fn describe(&self) -> String {
        format!(
            "ResNeXt(blocks={:?}, groups={}, bottleneck_width={}, num_classes={})",
            self.config.num_blocks,
            self.config.groups,
            self.config.bottleneck_width,
            self.num_classes()
        )
    }

    fn children(&self) -> Vec<&dyn Layer> {
        let mut children: Vec<&dyn Layer> = vec![&self.stem];
        children.extend(self.stages.iter().map(|s| s as &dyn Layer));
        children.push(&self.head);
        children
    }

    fn set_training(&mut self, training: bool) {
        self.stem.set_training(training);
        for stage in &mut self.stages {
            stage.set_training(training);
        }
    }
}

pub fn resnext50_2x32d() -> ResNeXt {
    ResNeXt::new(&ResNeXtConfig::resnext50_2x32d())
}
