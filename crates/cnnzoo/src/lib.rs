//! # cnnzoo
//!
//! Convolutional image classifiers declared as layer graphs, in pure Rust.
//!
//! ## Modules
//!
//! - **core** - Tensor engine: flat N-dimensional `f32`/`f64` arrays with shapes and broadcasting
//! - **nn** - Layers: Conv2d (grouped), BatchNorm2d, MaxPool2d, AdaptiveAvgPool2d, Linear, Sequential
//! - **models** - Architectures: VGG11/13/16/19 and ResNeXt50 (2x32d), plus JSON configs
//!
//! ```no_run
//! use cnnzoo::prelude::*;
//!
//! let mut net = resnext50_2x32d();
//! net.eval();
//! let images: Tensor<f32> = Tensor::randn(vec![2, 3, 32, 32], Some(0));
//! let logits = net.forward(&images).unwrap();
//! assert_eq!(logits.shape_vec(), vec![2, 10]);
//! ```

/// Core tensor engine.
pub use cnnzoo_core as core;

/// Neural network layers.
pub use cnnzoo_nn as nn;

/// VGG and ResNeXt architectures.
pub use cnnzoo_models as models;

/// Convenient re-exports.
pub mod prelude {
    pub use cnnzoo_core::{Shape, Tensor, TensorError, TensorResult};
    pub use cnnzoo_models::{
        resnext50_2x32d, vgg11, vgg13, vgg16, vgg19, ModelConfig, ModelError, ModelKind, Network,
        ResNeXt, ResNeXtConfig, Vgg, VggConfig,
    };
    pub use cnnzoo_nn::{Layer, Sequential};
}
