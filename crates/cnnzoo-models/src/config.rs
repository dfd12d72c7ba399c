//! Serializable model configurations and the named presets.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use cnnzoo_core::{Tensor, TensorResult};
use cnnzoo_nn::{Layer, Parameter};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ModelError;
use crate::resnext::{ResNeXt, ResNeXtConfig};
use crate::vgg::{Vgg, VggConfig};

/// A configuration for any supported architecture, tagged by `"arch"`.
///
/// ```json
/// { "arch": "resnext", "in_C": 32, "groups": 2, "bottleneck_width": 32, "num_blocks": [3, 4, 6, 3] }
/// { "arch": "vgg", "stages": [64, "M", 128, "M"], "num_classes": 100 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "arch", rename_all = "lowercase")]
pub enum ModelConfig {
    Vgg(VggConfig),
    ResNeXt(ResNeXtConfig),
}

impl ModelConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn to_json_pretty(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn num_classes(&self) -> usize {
        match self {
            ModelConfig::Vgg(c) => c.num_classes,
            ModelConfig::ResNeXt(c) => c.num_classes,
        }
    }

    pub fn image_channels(&self) -> usize {
        match self {
            ModelConfig::Vgg(c) => c.image_channels,
            ModelConfig::ResNeXt(c) => c.image_channels,
        }
    }

    pub fn build(&self) -> Network {
        match self {
            ModelConfig::Vgg(c) => Network::Vgg(Vgg::new(c)),
            ModelConfig::ResNeXt(c) => Network::ResNeXt(ResNeXt::new(c)),
        }
    }
}

/// Named presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    Vgg11,
    Vgg13,
    Vgg16,
    Vgg19,
    ResNeXt50_2x32d,
}

impl ModelKind {
    pub const ALL: [ModelKind; 5] = [
        ModelKind::Vgg11,
        ModelKind::Vgg13,
        ModelKind::Vgg16,
        ModelKind::Vgg19,
        ModelKind::ResNeXt50_2x32d,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::Vgg11 => "vgg11",
            ModelKind::Vgg13 => "vgg13",
            ModelKind::Vgg16 => "vgg16",
            ModelKind::Vgg19 => "vgg19",
            ModelKind::ResNeXt50_2x32d => "resnext50_2x32d",
        }
    }

    pub fn config(self) -> ModelConfig {
        match self {
            ModelKind::Vgg11 => ModelConfig::Vgg(VggConfig::vgg11()),
            ModelKind::Vgg13 => ModelConfig::Vgg(VggConfig::vgg13()),
            ModelKind::Vgg16 => ModelConfig::Vgg(VggConfig::vgg16()),
            ModelKind::Vgg19 => ModelConfig::Vgg(VggConfig::vgg19()),
            ModelKind::ResNeXt50_2x32d => ModelConfig::ResNeXt(ResNeXtConfig::resnext50_2x32d()),
        }
    }

    pub fn build(self) -> Network {
        info!(model = self.name(), "building preset");
        self.config().build()
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = ModelError;

    /// Case-insensitive; `-` and `_` are interchangeable.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        ModelKind::ALL
            .into_iter()
            .find(|k| k.name() == wanted)
            .ok_or_else(|| ModelError::UnknownModel {
                name: s.to_string(),
                known: ModelKind::ALL.map(ModelKind::name).join(", "),
            })
    }
}

/// A built model of either architecture.
pub enum Network {
    Vgg(Vgg),
    ResNeXt(ResNeXt),
}

impl Network {
    fn inner(&self) -> &dyn Layer {
        match self {
            Network::Vgg(m) => m,
            Network::ResNeXt(m) => m,
        }
    }

    pub fn num_classes(&self) -> usize {
        match self {
            Network::Vgg(m) => m.num_classes(),
            Network::ResNeXt(m) => m.num_classes(),
        }
    }

    pub fn arch(&self) -> &'static str {
        match self {
            Network::Vgg(_) => "vgg",
            Network::ResNeXt(_) => "resnext",
        }
    }
}

impl Layer for Network {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        self.inner().forward(input)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        self.inner().output_shape(input)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.inner().parameters()
    }

    fn describe(&self) -> String {
        self.inner().describe()
    }

    fn children(&self) -> Vec<&dyn Layer> {
        self.inner().children()
    }

    fn set_training(&mut self, training: bool) {
        match self {
            Network::Vgg(m) => m.set_training(training),
            Network::ResNeXt(m) => m.set_training(training),
        }
    }
}
