use cnnzoo_core::{Tensor, TensorResult};

use crate::layers::{Layer, Parameter};

/// Chains layers in order; the output of each feeds the next.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Layer>>,
}

impl Sequential {
    pub fn new() -> Self {
        Sequential { layers: Vec::new() }
    }

    /// Add a layer to the model.
    pub fn add(mut self, layer: Box<dyn Layer>) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append a layer in place.
    pub fn push<L: Layer + 'static>(&mut self, layer: L) {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = &dyn Layer> {
        self.layers.iter().map(|l| l.as_ref())
    }
}

impl Layer for Sequential {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let mut layers = self.layers.iter();
        let mut x = match layers.next() {
            Some(first) => first.forward(input)?,
            None => return Ok(input.clone()),
        };
        for layer in layers {
            x = layer.forward(&x)?;
        }
        Ok(x)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        self.layers
            .iter()
            .try_fold(input.to_vec(), |shape, layer| layer.output_shape(&shape))
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.layers.iter().flat_map(|l| l.parameters()).collect()
    }

    fn describe(&self) -> String {
        format!("Sequential({} layers)", self.layers.len())
    }

    fn children(&self) -> Vec<&dyn Layer> {
        self.layers().collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}
