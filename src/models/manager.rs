use crate::adapters::{InferenceAdapter, LayerInfo, OrtAdapter};
use crate::config::ModelSpec;
use crate::models::model::{AnyImageModel, ModelParams};
use crate::models::registry::ExportRegistry;
use crate::utils::error::ModelError;
use crate::{Config, Result};
use once_cell::sync::OnceCell;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A wrapper loaded at startup.
#[derive(Clone)]
pub struct LoadedModel {
    /// Lookup key: the model file stem, e.g. `yolox_tiny`.
    pub name: String,
    pub architecture: &'static str,
    pub path: PathBuf,
    pub model: Arc<dyn AnyImageModel>,
    /// Bounds concurrent inference on this model to `max_async_requests`.
    pub slots: Arc<Semaphore>,
}

impl LoadedModel {
    pub fn new(name: String, path: PathBuf, model: Arc<dyn AnyImageModel>, max_async_requests: usize) -> Self {
        Self {
            name,
            architecture: model.architecture(),
            path,
            model,
            slots: Arc::new(Semaphore::new(max_async_requests.max(1))),
        }
    }

    /// Request slots not taken by in-flight inference.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

/// Global model manager singleton
pub struct ModelManager {
    models: Vec<LoadedModel>,
    config: Config,
}

static MODEL_MANAGER: OnceCell<Arc<ModelManager>> = OnceCell::new();

impl ModelManager {
    /// Loads every model named in the config through the export registry.
    pub fn load(config: Config) -> Result<Self> {
        tracing::info!("Loading {} model(s)...", config.models.len());
        let registry = ExportRegistry::global()?;

        let mut models = Vec::with_capacity(config.models.len());
        for spec in &config.models {
            let loaded = Self::load_one(registry, &config, spec)?;
            tracing::info!(
                "Loaded '{}' as {} from {}",
                loaded.name,
                loaded.architecture,
                loaded.path.display()
            );
            models.push(loaded);
        }
        Self::from_models(config, models)
    }

    fn load_one(registry: &ExportRegistry, config: &Config, spec: &ModelSpec) -> Result<LoadedModel> {
        let path = config.model_path(spec);
        let params = ModelParams::load_optional(&spec.params_path(&config.models_dir))?;
        let adapter: Arc<dyn InferenceAdapter> = Arc::new(OrtAdapter::new(&path, &config.onnx_config)?);
        let model = registry.create_model(&spec.architecture, adapter, &params)?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| spec.architecture.clone());
        Ok(LoadedModel::new(
            name,
            path,
            model,
            config.pipeline_config.max_async_requests,
        ))
    }

    /// Builds a manager around already constructed models.
    pub fn from_models(config: Config, models: Vec<LoadedModel>) -> Result<Self> {
        for (i, model) in models.iter().enumerate() {
            if models[..i].iter().any(|other| other.name == model.name) {
                return Err(ModelError::Config(format!(
                    "Model name '{}' is used more than once",
                    model.name
                )));
            }
        }
        Ok(Self { models, config })
    }

    /// Installs the global model manager.
    pub fn init(config: Config) -> Result<()> {
        Self::install(Self::load(config)?)
    }

    pub fn install(manager: ModelManager) -> Result<()> {
        MODEL_MANAGER
            .set(Arc::new(manager))
            .map_err(|_| ModelError::Internal("Model manager already initialized".to_string()))?;
        tracing::info!("Model manager initialized successfully");
        Ok(())
    }

    /// Returns the global model manager instance.
    pub fn instance() -> Result<Arc<ModelManager>> {
        MODEL_MANAGER
            .get()
            .cloned()
            .ok_or_else(|| ModelError::Internal("Model manager not initialized".to_string()))
    }

    /// Looks a model up by file stem, then by architecture.
    pub fn get(&self, name: &str) -> Result<&LoadedModel> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .or_else(|| self.models.iter().find(|m| m.architecture == name))
            .ok_or_else(|| ModelError::InvalidInput(format!("No model named '{}' is loaded", name)))
    }

    pub fn models(&self) -> &[LoadedModel] {
        &self.models
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Checks that every loaded model is still a published wrapper with usable layers.
    pub fn health_check(&self) -> Result<()> {
        tracing::debug!("Performing model health check...");
        let registry = ExportRegistry::global()?;
        for loaded in &self.models {
            registry.resolve(loaded.architecture)?;
            let adapter = loaded.model.adapter();
            if adapter.inputs().is_empty() || adapter.outputs().is_empty() {
                return Err(ModelError::ModelLoad(format!(
                    "Model '{}' exposes no inputs or outputs",
                    loaded.name
                )));
            }
        }
        tracing::debug!("Model health check passed");
        Ok(())
    }

    pub fn get_stats(&self) -> ModelStats {
        ModelStats {
            models: self
                .models
                .iter()
                .map(|loaded| ModelInfo {
                    name: loaded.name.clone(),
                    architecture: loaded.architecture,
                    path: loaded.path.display().to_string(),
                    inputs: loaded.model.adapter().inputs().to_vec(),
                    outputs: loaded.model.adapter().outputs().to_vec(),
                    available_slots: loaded.available_slots(),
                })
                .collect(),
            intra_threads: self.config.onnx_config.intra_threads,
            optimization_level: self.config.onnx_config.optimization_level,
            max_async_requests: self.config.pipeline_config.max_async_requests,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub architecture: &'static str,
    pub path: String,
    pub inputs: Vec<LayerInfo>,
    pub outputs: Vec<LayerInfo>,
    pub available_slots: usize,
}

/// Model statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModelStats {
    pub models: Vec<ModelInfo>,
    pub intra_threads: usize,
    pub optimization_level: i32,
    pub max_async_requests: usize,
}

/// Convenience: fetch a loaded model by name
pub fn get_model(name: &str) -> Result<LoadedModel> {
    ModelManager::instance()?.get(name).cloned()
}

/// Convenience: run the model health check
pub fn health_check() -> Result<()> {
    ModelManager::instance()?.health_check()
}

/// Convenience: get model statistics
pub fn get_model_stats() -> Result<ModelStats> {
    Ok(ModelManager::instance()?.get_stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::RecordedAdapter;
    use ndarray::{ArrayD, IxDyn};

    fn ssd(name: &str) -> LoadedModel {
        let adapter = Arc::new(
            RecordedAdapter::new(vec![LayerInfo::new("image", vec![1, 3, 8, 8])])
                .with_output("detection_out", ArrayD::zeros(IxDyn(&[1, 1, 1, 7]))),
        );
        let model = ExportRegistry::global()
            .unwrap()
            .create_model("SSD", adapter, &ModelParams::default())
            .unwrap();
        LoadedModel::new(name.to_string(), PathBuf::from(format!("{}.onnx", name)), model, 2)
    }

    fn config() -> Config {
        Config::new("127.0.0.1:0".into(), "models".into(), &[], Some(1), None, false).unwrap()
    }

    #[test]
    fn models_are_found_by_name_or_architecture() {
        let manager = ModelManager::from_models(config(), vec![ssd("mobilenet_ssd")]).unwrap();
        assert_eq!(manager.get("mobilenet_ssd").unwrap().architecture, "SSD");
        assert_eq!(manager.get("SSD").unwrap().name, "mobilenet_ssd");
        assert!(manager.get("YOLOX").is_err());
        assert!(manager.health_check().is_ok());

        let stats = manager.get_stats();
        assert_eq!(stats.models.len(), 1);
        assert_eq!(stats.models[0].outputs[0].name, "detection_out");
        assert_eq!(stats.models[0].available_slots, 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(ModelManager::from_models(config(), vec![ssd("a"), ssd("a")]).is_err());
    }

    #[test]
    fn missing_model_files_fail_to_load() {
        let config = Config::new(
            "127.0.0.1:0".into(),
            "/nonexistent".into(),
            &["SSD=ssd.onnx".to_string()],
            Some(1),
            None,
            false,
        )
        .unwrap();
        assert!(matches!(ModelManager::load(config), Err(ModelError::ModelLoad(_))));
    }
}
