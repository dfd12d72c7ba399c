//! Image classifiers declared as layer graphs over `cnnzoo-nn`.
//!
//! - [`vgg`]: VGG11/13/16/19 with batch normalization
//! - [`resnext`]: ResNeXt with grouped-convolution bottlenecks
//! - [`head`]: the global-pool + linear classifier both share
//! - [`config`]: serializable configurations and named presets

pub mod config;
pub mod error;
pub mod head;
pub mod resnext;
pub mod vgg;

pub use config::{ModelConfig, ModelKind, Network};
pub use error::ModelError;
pub use head::ClassifierHead;
pub use resnext::{resnext50_2x32d, Bottleneck, ResNeXt, ResNeXtConfig};
pub use vgg::{vgg11, vgg13, vgg16, vgg19, Vgg, VggConfig, VggStage};

/// Channel count of the RGB images every preset expects.
pub const IMAGE_CHANNELS: usize = 3;

/// Class count of the CIFAR-10 style presets.
pub const DEFAULT_NUM_CLASSES: usize = 10;
