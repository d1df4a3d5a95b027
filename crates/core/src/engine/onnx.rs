//! ONNX Runtime engine for temporal super-resolution models.
//!
//! Models take a single 5-D input `[batch, slots, 3, H, W]` and produce a
//! single 4-D output `[batch, 3, H * scale, W * scale]`. FP16 models are fed
//! half-precision tensors; results are always returned as f32.

use anyhow::{bail, Context, Result};
use half::f16;
use ndarray::{Array4, Array5, Ix4};
use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, warn};

use super::backend::{build_session, SessionConfig};
use super::{EngineContract, InferenceEngine};
use crate::types::{TensorPrecision, CHANNELS};

pub struct OnnxEngine {
    session: Session,
    input_name: String,
    output_name: String,
    contract: EngineContract,
}

impl OnnxEngine {
    /// Loads the model and derives its contract from the declared IO shapes.
    ///
    /// `scale_hint` is required when the output spatial axes are dynamic and
    /// must agree with the shapes when they are not.
    pub fn load(config: &SessionConfig<'_>, scale_hint: Option<u32>) -> Result<Self> {
        debug!(
            model = %config.model_path.display(),
            backend = %config.backend,
            "Loading ONNX super-resolution model"
        );
        let session = build_session(config)?;

        let input = session.inputs().first().context("model declares no inputs")?;
        let output = session
            .outputs()
            .first()
            .context("model declares no outputs")?;
        let input_name = input.name().to_string();
        let output_name = output.name().to_string();

        let (input_shape, is_fp16) = match input.dtype() {
            ort::value::ValueType::Tensor { ty, shape, .. } => (
                shape.to_vec(),
                *ty == ort::tensor::TensorElementType::Float16,
            ),
            other => bail!("expected tensor input, got {other:?}"),
        };
        let output_shape = match output.dtype() {
            ort::value::ValueType::Tensor { shape, .. } => shape.to_vec(),
            other => bail!("expected tensor output, got {other:?}"),
        };

        let precision = if is_fp16 {
            TensorPrecision::F16
        } else {
            TensorPrecision::F32
        };
        let contract = contract_from_shapes(&input_shape, &output_shape, scale_hint, precision)
            .with_context(|| format!("unsupported model {}", config.model_path.display()))?;

        debug!(
            %input_name,
            %output_name,
            ?input_shape,
            ?output_shape,
            scale = contract.scale,
            is_fp16,
            "Detected model IO"
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            contract,
        })
    }
}

fn static_dim(value: i64) -> Option<usize> {
    (value > 0).then_some(value as usize)
}

/// Derives an [`EngineContract`] from ONNX shapes, where dynamic axes are
/// reported as non-positive values.
pub fn contract_from_shapes(
    input: &[i64],
    output: &[i64],
    scale_hint: Option<u32>,
    precision: TensorPrecision,
) -> Result<EngineContract> {
    if input.len() != 5 {
        bail!(
            "expected 5-D input [batch, frames, channels, height, width], got {}-D {input:?}",
            input.len()
        );
    }
    if output.len() != 4 {
        bail!(
            "expected 4-D output [batch, channels, height, width], got {}-D {output:?}",
            output.len()
        );
    }

    let slots = static_dim(input[1]).context("input frame axis must be static")?;
    let channels = match static_dim(input[2]) {
        Some(channels) => channels,
        None => {
            warn!("Dynamic channel axis; assuming RGB");
            CHANNELS
        }
    };
    let (height, width) = (static_dim(input[3]), static_dim(input[4]));

    let axis_scale = |axis: &str, input: Option<usize>, output: i64| -> Result<Option<u32>> {
        match (input, static_dim(output)) {
            (Some(input), Some(output)) => {
                if output % input != 0 {
                    bail!("output {axis} {output} is not a multiple of input {axis} {input}");
                }
                Ok(Some((output / input) as u32))
            }
            _ => Ok(None),
        }
    };
    let derived = match (
        axis_scale("height", height, output[2])?,
        axis_scale("width", width, output[3])?,
    ) {
        (Some(h), Some(w)) if h != w => bail!("non-uniform scale: height x{h}, width x{w}"),
        (Some(s), _) | (None, Some(s)) => Some(s),
        (None, None) => None,
    };

    let scale = match (derived, scale_hint) {
        (Some(derived), Some(hint)) if derived != hint => {
            bail!("configured scale x{hint} disagrees with model shapes (x{derived})")
        }
        (Some(scale), _) | (None, Some(scale)) => scale,
        (None, None) => bail!("model output size is dynamic; set an explicit scale"),
    };
    if scale == 0 {
        bail!("scale must be positive");
    }

    Ok(EngineContract {
        slots,
        channels,
        height,
        width,
        scale,
        max_batch: static_dim(input[0]),
        precision,
    })
}

impl InferenceEngine for OnnxEngine {
    fn contract(&self) -> &EngineContract {
        &self.contract
    }

    fn infer(&mut self, batch: Array5<f32>) -> Result<Array4<f32>> {
        let input_name = self.input_name.as_str();
        let output_name = self.output_name.as_str();

        let output = match self.contract.precision {
            TensorPrecision::F16 => {
                let input_tensor = Tensor::from_array(batch.mapv(f16::from_f32))?;
                let outputs = self
                    .session
                    .run(ort::inputs![input_name => &input_tensor])?;
                let output_view = outputs[output_name].try_extract_array::<f16>()?;
                output_view.mapv(f16::to_f32)
            }
            TensorPrecision::F32 => {
                let input_tensor = Tensor::from_array(batch)?;
                let outputs = self
                    .session
                    .run(ort::inputs![input_name => &input_tensor])?;
                let output_view = outputs[output_name].try_extract_array::<f32>()?;
                output_view.to_owned()
            }
        };

        output
            .into_dimensionality::<Ix4>()
            .context("model output is not 4-D")
    }
}
