pub mod settings;

pub use settings::{
    Config, ConfigError, EmbeddingConfig, EmbeddingProvider, OllamaConfig, VectorBackendKind,
    VectorStoreConfig,
};

/// Resolve the storage root: explicit override first, then `~/.dualstore`
#[inline]
pub fn resolve_root(
    explicit: Option<std::path::PathBuf>,
) -> Result<std::path::PathBuf, ConfigError> {
    match explicit {
        Some(root) => Ok(root),
        None => Config::default_root(),
    }
}
