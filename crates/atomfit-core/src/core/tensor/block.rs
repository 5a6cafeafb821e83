use super::TensorMapError;
use super::labels::Labels;
use candle_core::Tensor;

/// A values tensor with labelled axes and optional gradient sub-blocks.
///
/// The first axis is described by `samples`, the last by `properties`, and
/// every axis in between by one entry of `components`. Gradient blocks use a
/// first sample dimension named `sample` that points into the parent samples.
#[derive(Debug, Clone)]
pub struct TensorBlock {
    values: Tensor,
    samples: Labels,
    components: Vec<Labels>,
    properties: Labels,
    gradients: Vec<(String, TensorBlock)>,
}

impl TensorBlock {
    /// Creates a block, checking the values shape against the labels.
    ///
    /// # Errors
    ///
    /// Returns [`TensorMapError::ShapeMismatch`] when an axis length differs
    /// from the number of entries of its labels.
    pub fn new(
        values: Tensor,
        samples: Labels,
        components: Vec<Labels>,
        properties: Labels,
    ) -> Result<Self, TensorMapError> {
        let mut expected = vec![samples.count()];
        expected.extend(components.iter().map(Labels::count));
        expected.push(properties.count());
        if values.dims() != expected.as_slice() {
            return Err(TensorMapError::ShapeMismatch {
                expected,
                found: values.dims().to_vec(),
            });
        }
        Ok(Self {
            values,
            samples,
            components,
            properties,
            gradients: Vec::new(),
        })
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn samples(&self) -> &Labels {
        &self.samples
    }

    pub fn components(&self) -> &[Labels] {
        &self.components
    }

    pub fn properties(&self) -> &Labels {
        &self.properties
    }

    pub fn gradient(&self, parameter: &str) -> Option<&TensorBlock> {
        self.gradients
            .iter()
            .find(|(name, _)| name == parameter)
            .map(|(_, block)| block)
    }

    pub fn gradients(&self) -> impl Iterator<Item = (&str, &TensorBlock)> {
        self.gradients.iter().map(|(n, b)| (n.as_str(), b))
    }

    pub fn gradient_names(&self) -> Vec<&str> {
        self.gradients.iter().map(|(n, _)| n.as_str()).collect()
    }

    /// Attaches a gradient block with respect to `parameter`.
    ///
    /// The gradient must share this block's properties, and every entry of
    /// its `sample` dimension must point at an existing sample.
    pub fn add_gradient(
        &mut self,
        parameter: &str,
        gradient: TensorBlock,
    ) -> Result<(), TensorMapError> {
        if self.gradient(parameter).is_some() {
            return Err(TensorMapError::DuplicateGradient(parameter.to_string()));
        }
        let invalid = |reason: String| TensorMapError::InvalidGradient {
            parameter: parameter.to_string(),
            reason,
        };
        if gradient.properties != self.properties {
            return Err(invalid("properties differ from the parent block".into()));
        }
        if gradient.samples.names().first().map(String::as_str) != Some("sample") {
            return Err(invalid("first sample dimension must be 'sample'".into()));
        }
        let n_parent = self.samples.count() as i32;
        if let Some(bad) = gradient
            .samples
            .rows()
            .map(|row| row[0])
            .find(|s| *s < 0 || *s >= n_parent)
        {
            return Err(invalid(format!(
                "sample {bad} is outside the {n_parent} parent samples"
            )));
        }
        self.gradients.push((parameter.to_string(), gradient));
        Ok(())
    }

    /// A block with the same labels and gradients but new values.
    pub fn with_values(&self, values: Tensor) -> Result<Self, TensorMapError> {
        let mut block = Self::new(
            values,
            self.samples.clone(),
            self.components.clone(),
            self.properties.clone(),
        )?;
        block.gradients = self.gradients.clone();
        Ok(block)
    }

    /// Replaces the values of the gradient with respect to `parameter`.
    pub fn map_gradient(
        &mut self,
        parameter: &str,
        f: impl FnOnce(&Tensor) -> candle_core::Result<Tensor>,
    ) -> Result<(), TensorMapError> {
        if let Some((_, block)) = self.gradients.iter_mut().find(|(n, _)| n == parameter) {
            *block = block.with_values(f(&block.values)?)?;
        }
        Ok(())
    }

    /// Detaches the values and every gradient from the autograd graph.
    pub fn detach(&self) -> Result<Self, TensorMapError> {
        let mut block = Self::new(
            self.values.detach(),
            self.samples.clone(),
            self.components.clone(),
            self.properties.clone(),
        )?;
        for (name, gradient) in &self.gradients {
            block.gradients.push((name.clone(), gradient.detach()?));
        }
        Ok(block)
    }
}
