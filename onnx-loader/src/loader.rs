//! Loads a model directory into a [`PreTrainedModel`]
//!
//! Layout:
//!
//! ```text
//! <dir>/config.json
//! <dir>/generation_config.json        (optional)
//! <dir>/onnx/<graph><suffix>.onnx     (e.g. decoder_model_merged_fp16.onnx)
//! ```

use crate::config::SessionConfig;
use crate::error::{OnnxError, Result};
use crate::session::OnnxSession;
use ortgen_generation::model::session_files;
use ortgen_generation::{
    GenerationOptions, ModelConfig, ModelRegistry, PreTrainedModel, SharedSession,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Directory holding the `.onnx` graphs, relative to the model directory
    pub subfolder: String,
    /// Appended to every graph stem, e.g. `_fp16` or `_q4`
    pub suffix: String,
    pub session: SessionConfig,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            subfolder: "onnx".to_string(),
            suffix: String::new(),
            session: SessionConfig::default(),
        }
    }
}

/// Graph files a model directory must provide for its class
#[derive(Debug, Clone, PartialEq)]
pub struct GraphFile {
    pub key: &'static str,
    pub path: PathBuf,
    pub required: bool,
}

pub fn read_model_config(dir: &Path) -> Result<ModelConfig> {
    let path = dir.join("config.json");
    log::debug!("Reading model config from {:?}", path);
    Ok(ModelConfig::from_file(&path)?)
}

/// `generation_config.json` when present
pub fn read_generation_config(dir: &Path) -> Result<Option<GenerationOptions>> {
    let path = dir.join("generation_config.json");
    if !path.exists() {
        return Ok(None);
    }
    log::debug!("Reading generation config from {:?}", path);
    let text = std::fs::read_to_string(&path)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Resolves the model class and lists the graph files it needs.
pub fn graph_files(
    dir: &Path,
    config: &ModelConfig,
    registry: &ModelRegistry,
    options: &LoadOptions,
) -> Result<Vec<GraphFile>> {
    let class = registry.resolve(&config.architectures, &config.model_type)?;
    let folder = dir.join(&options.subfolder);
    Ok(session_files(class.kind)
        .iter()
        .map(|&(key, stem, required)| GraphFile {
            key,
            path: folder.join(format!("{}{}.onnx", stem, options.suffix)),
            required,
        })
        .collect())
}

/// Reads the configs, opens every graph the model class needs and assembles
/// the model.
pub fn load_pretrained(
    dir: impl AsRef<Path>,
    registry: Arc<ModelRegistry>,
    options: &LoadOptions,
) -> Result<PreTrainedModel> {
    let dir = dir.as_ref();
    log::info!("Loading pretrained model from {:?}", dir);

    let config = read_model_config(dir)?;
    let generation_config = read_generation_config(dir)?;
    let files = graph_files(dir, &config, &registry, options)?;

    let missing: Vec<String> = files
        .iter()
        .filter(|file| file.required && !file.path.exists())
        .map(|file| file.path.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(OnnxError::ModelLoadFailed(format!(
            "Missing model files: {}",
            missing.join(", ")
        )));
    }

    let mut sessions: HashMap<String, SharedSession> = HashMap::new();
    for file in files {
        if !file.path.exists() {
            log::debug!("Optional graph {} not found, skipping", file.key);
            continue;
        }
        let session = OnnxSession::load_with_config(&file.path, &options.session)?;
        sessions.insert(file.key.to_string(), Arc::new(session));
    }

    let mut model = PreTrainedModel::from_sessions(registry, config, sessions)?;
    if let Some(generation_config) = generation_config {
        model = model.with_generation_config(generation_config);
    }
    log::info!("Loaded {}", model.class().name);
    Ok(model)
}
