//! Optimization setup for a training run
//!
//! Resolves the attention backend, gradient checkpointing and padding
//! intents, and the autocast dtype once at construction. None of these
//! toggles may change training semantics; they only trade memory for
//! throughput.

use candle_core::{DType, Device, Tensor};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::trainstep::TrainStepConfig;

/// Attention kernel backend requested for the denoiser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionBackend {
    Default,
    Sdp,
    MemoryEfficient,
}

/// Compute dtype the whole predict call runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainDtype {
    F32,
    F16,
    Bf16,
}

impl TrainDtype {
    pub fn to_dtype(self) -> DType {
        match self {
            TrainDtype::F32 => DType::F32,
            TrainDtype::F16 => DType::F16,
            TrainDtype::Bf16 => DType::BF16,
        }
    }
}

/// Mixed-precision scope for one predict call.
///
/// Every tensor entering the step is promoted/demoted here, so the
/// rollout's repeated denoiser invocations all see the same dtype.
#[derive(Debug, Clone)]
pub struct AutocastContext {
    dtype: DType,
}

impl AutocastContext {
    pub fn new(train_dtype: TrainDtype) -> Self {
        Self {
            dtype: train_dtype.to_dtype(),
        }
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn cast(&self, tensor: &Tensor) -> candle_core::Result<Tensor> {
        if tensor.dtype() == self.dtype {
            Ok(tensor.clone())
        } else {
            tensor.to_dtype(self.dtype)
        }
    }
}

/// Optimization decisions resolved against the actual device.
#[derive(Debug, Clone)]
pub struct AppliedOptimizations {
    pub attention: AttentionBackend,
    pub gradient_checkpointing: bool,
    pub force_circular_padding: bool,
    pub autocast: AutocastContext,
}

/// Resolve configured optimizations for `device`.
///
/// An unavailable memory-efficient attention backend is the one recoverable
/// failure in the core: it logs and falls back to the default kernels.
pub fn setup_optimizations(config: &TrainStepConfig, device: &Device) -> AppliedOptimizations {
    let attention = match config.attention {
        AttentionBackend::MemoryEfficient if !device.is_cuda() => {
            warn!(
                "Memory efficient attention is not available on {:?}, \
                 falling back to default attention",
                device.location()
            );
            AttentionBackend::Default
        }
        other => other,
    };

    if config.gradient_checkpointing {
        info!("Gradient checkpointing enabled for denoiser forward passes");
    }
    if config.force_circular_padding {
        info!("Circular padding requested for convolution layers");
    }

    AppliedOptimizations {
        attention,
        gradient_checkpointing: config.gradient_checkpointing,
        force_circular_padding: config.force_circular_padding,
        autocast: AutocastContext::new(config.train_dtype),
    }
}
