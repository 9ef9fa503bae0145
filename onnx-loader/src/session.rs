//! ONNX Runtime session behind the generation core's session trait

use crate::config::SessionConfig;
use crate::convert::{from_value, to_value};
use crate::error::{OnnxError, Result};
use async_trait::async_trait;
use ort::session::Session;
use ort::value::DynValue;
use ortgen_generation::{Feeds, InferenceSession, NamedTensors};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A loaded `.onnx` graph
///
/// `ort` sessions need exclusive access to run, so the session sits behind a
/// mutex and each `run` executes on the blocking thread pool. Outputs are
/// copied to host memory, so nothing needs to be handed back on release.
#[derive(Clone)]
pub struct OnnxSession {
    model_path: PathBuf,
    input_names: Vec<String>,
    output_names: Vec<String>,
    session: Arc<Mutex<Session>>,
}

impl std::fmt::Debug for OnnxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxSession")
            .field("model_path", &self.model_path)
            .field("input_names", &self.input_names)
            .field("output_names", &self.output_names)
            .finish_non_exhaustive()
    }
}

impl OnnxSession {
    /// Load an ONNX model with default settings
    pub fn load<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        Self::load_with_config(model_path, &SessionConfig::default())
    }

    pub fn load_with_config<P: AsRef<Path>>(model_path: P, config: &SessionConfig) -> Result<Self> {
        let model_path = model_path.as_ref();
        log::info!("Loading ONNX model from: {:?}", model_path);

        if !model_path.exists() {
            return Err(OnnxError::ModelLoadFailed(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }
        config.validate()?;

        let providers = config.execution_providers();
        log::info!("Configuring session with {} execution providers", providers.len());

        let session = Session::builder()
            .map_err(|e| OnnxError::SessionCreationFailed(e.to_string()))?
            .with_execution_providers(&providers)
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!("Failed to set execution providers: {}", e))
            })?
            .with_optimization_level(config.graph_optimization_level())
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!("Failed to set optimization level: {}", e))
            })?
            .with_intra_threads(config.intra_threads)
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!("Failed to set intra threads: {}", e))
            })?
            .with_inter_threads(config.inter_threads)
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!("Failed to set inter threads: {}", e))
            })?
            .with_parallel_execution(config.parallel_execution)
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!(
                    "Failed to configure parallel execution: {}",
                    e
                ))
            })?
            .with_memory_pattern(config.memory_pattern)
            .map_err(|e| {
                OnnxError::SessionCreationFailed(format!("Failed to configure memory pattern: {}", e))
            })?
            .commit_from_file(model_path)
            .map_err(|e| OnnxError::ModelLoadFailed(e.to_string()))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        log::info!(
            "ONNX model loaded: {} inputs, {} outputs",
            input_names.len(),
            output_names.len()
        );
        log::debug!("  - inputs: {:?}", input_names);
        log::debug!("  - outputs: {:?}", output_names);

        Ok(Self {
            model_path: model_path.to_path_buf(),
            input_names,
            output_names,
            session: Arc::new(Mutex::new(session)),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Direct access to the underlying `ort::Session`
    pub fn session(&self) -> Arc<Mutex<Session>> {
        Arc::clone(&self.session)
    }

    fn run_blocking(
        session: &Mutex<Session>,
        output_names: &[String],
        inputs: Vec<(String, DynValue)>,
    ) -> Result<NamedTensors> {
        let mut session = session
            .lock()
            .map_err(|e| OnnxError::InferenceFailed(format!("Failed to lock session: {}", e)))?;
        let outputs = session
            .run(inputs)
            .map_err(|e| OnnxError::InferenceFailed(e.to_string()))?;

        let mut tensors = NamedTensors::with_capacity(output_names.len());
        for name in output_names {
            let value = outputs.get(name.as_str()).ok_or_else(|| {
                OnnxError::InferenceFailed(format!("Session did not return output {}", name))
            })?;
            tensors.insert(name.clone(), from_value(name, value)?);
        }
        Ok(tensors)
    }
}

#[async_trait]
impl InferenceSession for OnnxSession {
    fn input_names(&self) -> &[String] {
        &self.input_names
    }

    fn output_names(&self) -> &[String] {
        &self.output_names
    }

    async fn run(&self, feeds: &Feeds<'_>) -> ortgen_generation::Result<NamedTensors> {
        let inputs = feeds
            .iter()
            .map(|(name, tensor)| Ok((name.to_string(), to_value(tensor)?)))
            .collect::<Result<Vec<_>>>()?;
        log::trace!("running {:?} with {} inputs", self.model_path, inputs.len());

        let session = Arc::clone(&self.session);
        let output_names = self.output_names.clone();
        let outputs = tokio::task::spawn_blocking(move || {
            Self::run_blocking(&session, &output_names, inputs)
        })
        .await
        .map_err(|e| OnnxError::InferenceFailed(format!("Inference task failed: {}", e)))??;
        Ok(outputs)
    }
}
