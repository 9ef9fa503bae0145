//! Session builder settings

use crate::error::{OnnxError, Result};
use ort::execution_providers::{CPUExecutionProvider, ExecutionProviderDispatch};
use ort::session::builder::GraphOptimizationLevel;
use serde::{Deserialize, Serialize};

/// Execution provider to register, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Cpu,
    Cuda,
    DirectMl,
    CoreMl,
}

impl Provider {
    /// `None` when the crate was built without the matching feature.
    fn dispatch(self) -> Option<ExecutionProviderDispatch> {
        match self {
            Self::Cpu => Some(CPUExecutionProvider::default().build()),
            Self::Cuda => {
                #[cfg(feature = "cuda")]
                {
                    Some(ort::execution_providers::CUDAExecutionProvider::default().build())
                }
                #[cfg(not(feature = "cuda"))]
                {
                    None
                }
            }
            Self::DirectMl => {
                #[cfg(feature = "directml")]
                {
                    Some(ort::execution_providers::DirectMLExecutionProvider::default().build())
                }
                #[cfg(not(feature = "directml"))]
                {
                    None
                }
            }
            Self::CoreMl => {
                #[cfg(feature = "coreml")]
                {
                    Some(ort::execution_providers::CoreMLExecutionProvider::default().build())
                }
                #[cfg(not(feature = "coreml"))]
                {
                    None
                }
            }
        }
    }
}

/// Settings applied to every session of a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub providers: Vec<Provider>,
    /// 0 disables graph optimizations, 3 enables all of them
    pub optimization_level: u8,
    pub intra_threads: usize,
    pub inter_threads: usize,
    pub parallel_execution: bool,
    pub memory_pattern: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            providers: vec![Provider::Cpu],
            optimization_level: 3,
            intra_threads: 4,
            inter_threads: 2,
            parallel_execution: true,
            memory_pattern: true,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.optimization_level > 3 {
            return Err(OnnxError::InvalidInput(format!(
                "optimization_level must be 0-3, got {}",
                self.optimization_level
            )));
        }
        if self.intra_threads == 0 || self.inter_threads == 0 {
            return Err(OnnxError::InvalidInput(
                "thread counts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn graph_optimization_level(&self) -> GraphOptimizationLevel {
        match self.optimization_level {
            0 => GraphOptimizationLevel::Disable,
            1 => GraphOptimizationLevel::Level1,
            2 => GraphOptimizationLevel::Level2,
            _ => GraphOptimizationLevel::Level3,
        }
    }

    /// Registered providers; unavailable ones are skipped, CPU is the fallback.
    pub(crate) fn execution_providers(&self) -> Vec<ExecutionProviderDispatch> {
        let mut dispatch = Vec::new();
        for provider in &self.providers {
            match provider.dispatch() {
                Some(ep) => dispatch.push(ep),
                None => log::warn!(
                    "{:?} execution provider not compiled in, skipping",
                    provider
                ),
            }
        }
        if dispatch.is_empty() {
            log::warn!("No execution providers available, falling back to CPU");
            dispatch.push(CPUExecutionProvider::default().build());
        }
        dispatch
    }
}
