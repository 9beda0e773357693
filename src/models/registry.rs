//! Runtime index over the published wrapper names.
//!
//! The `pub use` lines in `models` make the compiler check that every published
//! symbol exists. This index records where each one lives and what it is, validates
//! the published list once, and builds image wrappers by name.

use crate::adapters::InferenceAdapter;
use crate::models::model::{AnyImageModel, FromAdapter, ModelParams};
use crate::utils::error::ModelError;
use crate::Result;
use once_cell::sync::OnceCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

pub type ImageModelFactory = fn(Arc<dyn InferenceAdapter>, &ModelParams) -> Result<Arc<dyn AnyImageModel>>;

/// Builds the wrapper `M` behind the object-safe image interface.
pub fn factory<M>(adapter: Arc<dyn InferenceAdapter>, params: &ModelParams) -> Result<Arc<dyn AnyImageModel>>
where
    M: FromAdapter + AnyImageModel + 'static,
{
    Ok(Arc::new(M::from_adapter(adapter, params)?))
}

#[derive(Clone, Copy)]
pub enum SymbolKind {
    /// Wrapper taking an image, constructible by name.
    ImageModel(ImageModelFactory),
    /// Wrapper taking token ids.
    TextModel,
    /// Result or helper type.
    Type,
    Constant,
}

impl SymbolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SymbolKind::ImageModel(_) => "image_model",
            SymbolKind::TextModel => "text_model",
            SymbolKind::Type => "type",
            SymbolKind::Constant => "constant",
        }
    }
}

impl std::fmt::Debug for SymbolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One published symbol and the module that defines it.
#[derive(Debug, Clone, Copy)]
pub struct Export {
    pub name: &'static str,
    pub module: &'static str,
    pub kind: SymbolKind,
}

impl Export {
    /// Fully qualified path, e.g. `models::ssd::SSD`.
    pub fn path(&self) -> String {
        format!("models::{}::{}", self.module, self.name)
    }

    pub fn is_image_model(&self) -> bool {
        matches!(self.kind, SymbolKind::ImageModel(_))
    }
}

/// Validated published surface, in publication order.
#[derive(Debug)]
pub struct ExportRegistry {
    exports: Vec<Export>,
    by_name: HashMap<&'static str, usize>,
}

static REGISTRY: OnceCell<ExportRegistry> = OnceCell::new();

impl ExportRegistry {
    /// Validates the crate's own published surface.
    pub fn load() -> Result<Self> {
        Self::from_parts(super::PUBLIC_SURFACE, super::EXPORTS)
    }

    /// Process-wide registry, validated on first use.
    pub fn global() -> Result<&'static Self> {
        REGISTRY.get_or_try_init(|| {
            let registry = Self::load()?;
            tracing::debug!("Export registry loaded with {} names", registry.len());
            Ok(registry)
        })
    }

    /// Builds a registry from a published name list and the known exports.
    ///
    /// Fails if a name is listed twice, a listed name has no export, or an export
    /// is missing from the list.
    pub fn from_parts(surface: &[&'static str], exports: &[Export]) -> Result<Self> {
        let mut seen = HashSet::new();
        for name in surface {
            if !seen.insert(*name) {
                return Err(ModelError::unresolved(*name, "listed more than once"));
            }
        }

        let mut known: HashMap<&'static str, Export> = HashMap::new();
        for export in exports {
            if known.insert(export.name, *export).is_some() {
                return Err(ModelError::unresolved(export.name, "exported by more than one module"));
            }
            if !seen.contains(export.name) {
                return Err(ModelError::unresolved(export.name, "re-exported but not listed"));
            }
        }

        let mut ordered = Vec::with_capacity(surface.len());
        let mut by_name = HashMap::with_capacity(surface.len());
        for name in surface {
            let export = known
                .get(name)
                .ok_or_else(|| ModelError::unresolved(*name, "no module defines this symbol"))?;
            by_name.insert(export.name, ordered.len());
            ordered.push(*export);
        }

        Ok(Self {
            exports: ordered,
            by_name,
        })
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.exports.iter().map(|export| export.name)
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn resolve(&self, name: &str) -> Result<&Export> {
        self.by_name
            .get(name)
            .map(|&index| &self.exports[index])
            .ok_or_else(|| ModelError::unresolved(name, "not a published name"))
    }

    /// Published image wrappers, in publication order.
    pub fn image_models(&self) -> impl Iterator<Item = &Export> + '_ {
        self.exports.iter().filter(|export| export.is_image_model())
    }

    /// Instantiates the image wrapper published as `name`.
    pub fn create_model(
        &self,
        name: &str,
        adapter: Arc<dyn InferenceAdapter>,
        params: &ModelParams,
    ) -> Result<Arc<dyn AnyImageModel>> {
        let export = self.resolve(name)?;
        match export.kind {
            SymbolKind::ImageModel(build) => {
                tracing::debug!("Creating {} from {}", name, export.path());
                build(adapter, params)
            }
            other => Err(ModelError::InvalidInput(format!(
                "{} is a {}, not an image model",
                name,
                other.as_str()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn export(name: &'static str) -> Export {
        Export {
            name,
            module: "utils",
            kind: SymbolKind::Type,
        }
    }

    #[test]
    fn published_order_is_kept() {
        let registry = ExportRegistry::from_parts(&["B", "A"], &[export("A"), export("B")]).unwrap();
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["B", "A"]);
        assert_eq!(registry.resolve("A").unwrap().path(), "models::utils::A");
    }

    #[test]
    fn duplicates_are_rejected() {
        let err = ExportRegistry::from_parts(&["A", "A"], &[export("A")]).unwrap_err();
        assert!(matches!(err, ModelError::UnresolvedExport { ref name, .. } if name == "A"));
    }

    #[test]
    fn unlisted_exports_are_rejected() {
        let err = ExportRegistry::from_parts(&["A"], &[export("A"), export("B")]).unwrap_err();
        assert!(matches!(err, ModelError::UnresolvedExport { ref name, .. } if name == "B"));
    }

    #[test]
    fn text_models_cannot_be_built_as_image_models() {
        let registry = ExportRegistry::global().unwrap();
        let adapter = Arc::new(crate::adapters::RecordedAdapter::new(Vec::new()));
        let err = registry
            .create_model("BertEmbedding", adapter, &ModelParams::default())
            .err()
            .unwrap();
        assert!(matches!(err, ModelError::InvalidInput(_)));
    }
}
