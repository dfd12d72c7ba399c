use cnnzoo_core::{Tensor, TensorResult};
use cnnzoo_nn::{AdaptiveAvgPool2d, Flatten, Layer, Linear, Parameter};

/// Global average pooling, flatten, then one affine projection to class scores.
///
/// `[N, C, H, W] -> [N, C, 1, 1] -> [N, C] -> [N, num_classes]`
pub struct ClassifierHead {
    pool: AdaptiveAvgPool2d,
    flatten: Flatten,
    fc: Linear,
}

impl ClassifierHead {
    pub fn new(in_features: usize, num_classes: usize) -> Self {
        ClassifierHead {
            pool: AdaptiveAvgPool2d::global(),
            flatten: Flatten,
            fc: Linear::new(in_features, num_classes),
        }
    }

    pub fn in_features(&self) -> usize {
        self.fc.in_features
    }

    pub fn num_classes(&self) -> usize {
        self.fc.out_features
    }
}

impl Layer for ClassifierHead {
    fn forward(&self, input: &Tensor<f32>) -> TensorResult<Tensor<f32>> {
        let pooled = self.pool.forward(input)?;
        let features = self.flatten.forward(&pooled)?;
        self.fc.forward(&features)
    }

    fn output_shape(&self, input: &[usize]) -> TensorResult<Vec<usize>> {
        let pooled = self.pool.output_shape(input)?;
        let features = self.flatten.output_shape(&pooled)?;
        self.fc.output_shape(&features)
    }

    fn parameters(&self) -> Vec<&Parameter> {
        self.fc.parameters()
    }

    fn describe(&self) -> String {
        format!("ClassifierHead({} -> {})", self.in_features(), self.num_classes())
    }

    fn children(&self) -> Vec<&dyn Layer> {
        vec![&self.pool as &dyn Layer, &self.flatten, &self.fc]
    }
}
