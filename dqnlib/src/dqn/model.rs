use std::{collections::HashSet, path::Path};

use crate::io::fs::replace_atomically;

use super::*;

fn default_hidden() -> Vec<i64> {
    vec![128, 128]
}

fn default_input_scale() -> f64 {
    1.0
}

/// Model architecture information.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum ModelSettings {
    /// Fully connected layers with ReLU in between, applied to the flattened observation.
    Dense {
        #[serde(default = "default_hidden")]
        hidden: Vec<i64>,
    },
    /// Convolutional network for image-like observations, `[H, W]` or `[C, H, W]`.
    /// Inputs are divided by `input_scale` before the first layer.
    Conv {
        #[serde(default = "default_input_scale")]
        input_scale: f64,
    },
}

impl Default for ModelSettings {
    fn default() -> Self {
        ModelSettings::Dense {
            hidden: default_hidden(),
        }
    }
}

/// (output channels, kernel size, stride) of each convolution.
const CONV_LAYERS: [(i64, i64, i64); 3] = [(32, 8, 4), (64, 4, 2), (64, 3, 1)];
const CONV_HIDDEN: i64 = 512;

/// Zero if the input is smaller than the kernel.
fn conv_output_size(size: i64, kernel: i64, stride: i64) -> i64 {
    if size < kernel {
        0
    } else {
        (size - kernel) / stride + 1
    }
}

fn build_dense(root: &nn::Path, hidden: &[i64], input_size: i64, output_size: i64) -> QFunc {
    let mut last_size = input_size;
    let mut seq = nn::seq().add_fn(|xs| xs.flatten(1, -1));
    for (i, &size) in hidden.iter().enumerate() {
        seq = seq
            .add(nn::linear(
                root / format!("layer{i}"),
                last_size,
                size,
                Default::default(),
            ))
            .add_fn(|xs| xs.relu());
        last_size = size;
    }
    // Add the final output layer
    seq = seq.add(nn::linear(
        root / "output",
        last_size,
        output_size,
        Default::default(),
    ));
    Box::new(move |xs: &Tensor| xs.apply(&seq))
}

fn build_conv(
    root: &nn::Path,
    input_shape: &[usize],
    input_scale: f64,
    output_size: i64,
) -> Result<QFunc> {
    let (channels, height, width) = match *input_shape {
        [h, w] => (1, h as i64, w as i64),
        [c, h, w] => (c as i64, h as i64, w as i64),
        _ => {
            return Err(DqnError::InvalidSettings(format!(
                "convolutional model expects [H, W] or [C, H, W] observations, got {:?}",
                input_shape
            )))
        }
    };
    if input_scale <= 0.0 {
        return Err(DqnError::InvalidSettings(
            "input_scale must be positive".to_string(),
        ));
    }

    let mut seq = nn::seq();
    let (mut last_channels, mut h, mut w) = (channels, height, width);
    for (i, &(out_channels, kernel, stride)) in CONV_LAYERS.iter().enumerate() {
        h = conv_output_size(h, kernel, stride);
        w = conv_output_size(w, kernel, stride);
        if h <= 0 || w <= 0 {
            return Err(DqnError::InvalidSettings(format!(
                "observation {:?} is too small for the convolutional model",
                input_shape
            )));
        }
        let config = nn::ConvConfig {
            stride,
            ..Default::default()
        };
        seq = seq
            .add(nn::conv2d(
                root / format!("conv{i}"),
                last_channels,
                out_channels,
                kernel,
                config,
            ))
            .add_fn(|xs| xs.relu());
        last_channels = out_channels;
    }
    let flat_size = last_channels * h * w;
    seq = seq
        .add_fn(|xs| xs.flatten(1, -1))
        .add(nn::linear(
            root / "fc",
            flat_size,
            CONV_HIDDEN,
            Default::default(),
        ))
        .add_fn(|xs| xs.relu())
        .add(nn::linear(
            root / "output",
            CONV_HIDDEN,
            output_size,
            Default::default(),
        ));

    Ok(Box::new(move |xs: &Tensor| {
        let batch = xs.size()[0];
        (xs.reshape([batch, channels, height, width]) / input_scale).apply(&seq)
    }))
}

pub type QFunc = Box<dyn Fn(&Tensor) -> Tensor + Send>;

/// Maps a batch of observations `[B, ...input_shape]` to Q-values `[B, num_actions]`.
pub struct QNetwork {
    pub vs: nn::VarStore,
    func: QFunc,
    input_shape: Vec<usize>,
    num_actions: usize,
}

impl QNetwork {
    pub fn new(
        device: tch::Device,
        input_shape: &[usize],
        num_actions: usize,
        settings: &ModelSettings,
    ) -> Result<Self> {
        if num_actions == 0 {
            return Err(DqnError::InvalidSettings(
                "there must be at least one action".to_string(),
            ));
        }
        if input_shape.is_empty() || input_shape.contains(&0) {
            return Err(DqnError::InvalidSettings(format!(
                "invalid observation shape {:?}",
                input_shape
            )));
        }
        let vs = nn::VarStore::new(device);
        let root = &vs.root();
        let output_size = num_actions as i64;
        let func = match settings {
            ModelSettings::Dense { hidden } => {
                if hidden.iter().any(|&size| size <= 0) {
                    return Err(DqnError::InvalidSettings(format!(
                        "invalid hidden layer sizes {:?}",
                        hidden
                    )));
                }
                let input_size = input_shape.iter().product::<usize>() as i64;
                build_dense(root, hidden, input_size, output_size)
            }
            ModelSettings::Conv { input_scale } => {
                build_conv(root, input_shape, *input_scale, output_size)?
            }
        };
        Ok(Self {
            vs,
            func,
            input_shape: input_shape.to_vec(),
            num_actions,
        })
    }

    /// A forward pass without shape checks.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        (self.func)(input)
    }

    /// Returns an error unless `input` is `[B, ...input_shape]`.
    pub fn check_input(&self, input: &Tensor) -> Result<()> {
        let size = input.size();
        let matches = size.len() == self.input_shape.len() + 1
            && size[1..]
                .iter()
                .zip(&self.input_shape)
                .all(|(&a, &b)| a == b as i64);
        if matches {
            Ok(())
        } else {
            let mut expected = vec!["B".to_string()];
            expected.extend(self.input_shape.iter().map(|d| d.to_string()));
            Err(DqnError::shape_mismatch(expected, size))
        }
    }

    /// Q-values of a single observation, computed without gradients.
    pub fn q_values(&self, observation: &Observation) -> Result<Vec<f32>> {
        if observation.shape() != self.input_shape.as_slice() {
            return Err(DqnError::shape_mismatch(
                &self.input_shape,
                observation.shape(),
            ));
        }
        let output = tch::no_grad(|| {
            let input = observation_to_tensor(observation)
                .unsqueeze(0)
                .to_device(self.device());
            self.forward(&input)
        });
        let output = output.squeeze_dim(0).to_device(tch::Device::Cpu);
        Ok(Vec::<f32>::try_from(&output)?)
    }

    pub fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    pub fn num_actions(&self) -> usize {
        self.num_actions
    }

    pub fn device(&self) -> tch::Device {
        self.vs.device()
    }

    /// Copies parameters from another network with the same architecture.
    pub fn copy_from(&mut self, other: &QNetwork) -> Result<()> {
        Ok(self.vs.copy(&other.vs)?)
    }

    /// Save the parameters, replacing the file atomically.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        replace_atomically(path.as_ref(), |tmp| Ok(self.vs.save(tmp)?))
    }

    /// Read parameters from a file and validate them against this network's architecture.
    /// Nothing is applied; see [`QNetwork::apply_parameters`].
    pub fn read_parameters<P: AsRef<Path>>(&self, path: P) -> Result<Vec<(String, Tensor)>> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(DqnError::ArtifactNotFound(path.to_path_buf()));
        }
        let named = Tensor::load_multi(path)?;
        let variables = self.vs.variables();
        let mut seen = HashSet::with_capacity(named.len());
        for (name, tensor) in &named {
            match variables.get(name) {
                Some(variable) if variable.size() == tensor.size() => {
                    seen.insert(name.as_str());
                }
                Some(variable) => {
                    return Err(DqnError::ShapeMismatch {
                        expected: format!("{} {:?}", name, variable.size()),
                        actual: format!("{} {:?}", name, tensor.size()),
                    })
                }
                None => {
                    return Err(DqnError::ShapeMismatch {
                        expected: format!("parameters {:?}", sorted_names(&variables)),
                        actual: format!("unknown parameter {}", name),
                    })
                }
            }
        }
        if seen.len() != variables.len() {
            let missing: Vec<&str> = sorted_names(&variables)
                .into_iter()
                .filter(|name| !seen.contains(name))
                .collect();
            return Err(DqnError::ShapeMismatch {
                expected: format!("parameters {:?}", sorted_names(&variables)),
                actual: format!("missing {:?}", missing),
            });
        }
        Ok(named)
    }

    /// Overwrite the parameters in place with validated tensors from [`QNetwork::read_parameters`].
    pub fn apply_parameters(&mut self, named: Vec<(String, Tensor)>) -> Result<()> {
        let mut variables = self.vs.variables();
        tch::no_grad(|| -> Result<()> {
            for (name, tensor) in named {
                if let Some(variable) = variables.get_mut(&name) {
                    variable.f_copy_(&tensor)?;
                }
            }
            Ok(())
        })
    }

    /// Load parameters saved by [`QNetwork::save`].
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let named = self.read_parameters(path)?;
        self.apply_parameters(named)
    }
}

fn sorted_names(variables: &std::collections::HashMap<String, Tensor>) -> Vec<&str> {
    let mut names: Vec<&str> = variables.keys().map(|name| name.as_str()).collect();
    names.sort_unstable();
    names
}
