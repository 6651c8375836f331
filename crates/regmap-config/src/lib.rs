//! Configuration for regmap.
//!
//! Values are layered, later sources winning:
//! 1. built-in defaults
//! 2. a TOML file (`--config`, else `~/.config/regmap/config.toml` if present)
//! 3. `REGMAP_*` environment variables, `__` separating nested keys
//!    (e.g. `REGMAP_RETRIEVAL__TOP_K=5`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use config::{Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Invalid configuration values.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NotPositive { field: &'static str },

    #[error("generation.temperature must be between 0 and 2, got {0}")]
    Temperature(f32),

    #[error("{field} is empty")]
    Empty { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub index: IndexConfig,
    pub retrieval: RetrievalConfig,
    pub embedding: EmbeddingsConfig,
    pub generation: GenerationConfig,
    pub vector: VectorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory holding the persisted indexes
    pub dir: String,
    pub min_chunk_chars: usize,
    pub parallel_graph: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub per_retriever_k: usize,
    pub rrf_k: f64,
    pub graph_max_hops: usize,
    pub graph_score_scale: f64,
    pub use_lexical: bool,
    pub use_vector: bool,
    pub use_hyde: bool,
    pub use_graph: bool,
    pub embed_timeout_secs: u64,
    pub generate_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingsConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Key value, or `${ENV_VAR}`
    pub api_key: Option<String>,
    /// Variable consulted when `api_key` is unset
    pub api_key_env: String,
    pub dimensions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    /// Exact search over `vectors.json` in the index directory
    Flat,
    Qdrant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub backend: VectorBackend,
    pub qdrant_url: String,
    pub qdrant_api_key: Option<String>,
    pub collection: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            index: IndexConfig::default(),
            retrieval: RetrievalConfig::default(),
            embedding: EmbeddingsConfig::default(),
            generation: GenerationConfig::default(),
            vector: VectorConfig::default(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: "data/indexes".to_string(),
            min_chunk_chars: 50,
            parallel_graph: true,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            per_retriever_k: 20,
            rrf_k: 60.0,
            graph_max_hops: 2,
            graph_score_scale: 3.0,
            use_lexical: true,
            use_vector: true,
            use_hyde: true,
            use_graph: true,
            embed_timeout_secs: 30,
            generate_timeout_secs: 60,
        }
    }
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com/v1/embeddings".to_string(),
            model: "text-embedding-3-small".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            dimensions: 1536,
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_tokens: 200,
            temperature: 0.3,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Flat,
            qdrant_url: "http://localhost:6334".to_string(),
            qdrant_api_key: None,
            collection: "policy_sections".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from defaults, the config file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_from(path, None)
    }

    /// Like [`load`](Self::load), reading variables from `env` instead of the
    /// process environment when given.
    pub fn load_from(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let defaults = config::Config::try_from(&Config::default())
            .context("Failed to build default configuration")?;
        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("Config file not found: {:?}", path);
                }
                builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
            }
            None => {
                if let Some(path) = default_config_path() {
                    builder =
                        builder.add_source(File::from(path.as_path()).format(FileFormat::Toml).required(false));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("REGMAP")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(env),
        );

        let config: Config = builder
            .build()
            .context("Failed to load configuration")?
            .try_deserialize()
            .context("Invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges.
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        let positive = [
            ("retrieval.top_k", self.retrieval.top_k),
            ("retrieval.per_retriever_k", self.retrieval.per_retriever_k),
            ("embedding.dimensions", self.embedding.dimensions),
            ("generation.max_tokens", self.generation.max_tokens as usize),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::NotPositive { field });
            }
        }
        if self.retrieval.rrf_k <= 0.0 {
            return Err(ConfigError::NotPositive { field: "retrieval.rrf_k" });
        }
        if self.retrieval.graph_score_scale <= 0.0 {
            return Err(ConfigError::NotPositive {
                field: "retrieval.graph_score_scale",
            });
        }
        if !(0.0..=2.0).contains(&self.generation.temperature) {
            return Err(ConfigError::Temperature(self.generation.temperature));
        }
        if self.index.dir.trim().is_empty() {
            return Err(ConfigError::Empty { field: "index.dir" });
        }
        Ok(())
    }

    /// Index directory with `~` and environment variables expanded.
    pub fn index_dir(&self) -> PathBuf {
        expand_path(&self.index.dir)
    }

    /// Effective configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}

impl EmbeddingsConfig {
    /// API key from `api_key`, else from the `api_key_env` variable.
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key, &self.api_key_env)
    }
}

impl GenerationConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.api_key, &self.api_key_env)
    }
}

impl VectorConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(&self.qdrant_api_key, "")
    }
}

/// `~/.config/regmap/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".config").join("regmap").join("config.toml"))
}

/// Expand a leading `~` and `$VAR`/`${VAR}` references in a path.
/// An unset variable leaves the path as written.
pub fn expand_path(path: &str) -> PathBuf {
    match shellexpand::full(path) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(path),
    }
}

/// Resolve a configured key, expanding `${ENV_VAR}`, falling back to `fallback_env`.
fn resolve_api_key(api_key: &Option<String>, fallback_env: &str) -> Option<String> {
    match api_key {
        Some(key) if key.starts_with("${") && key.ends_with('}') => {
            let var_name = &key[2..key.len() - 1];
            std::env::var(var_name).ok().filter(|v| !v.is_empty())
        }
        Some(key) if !key.is_empty() => Some(key.clone()),
        _ if !fallback_env.is_empty() => std::env::var(fallback_env).ok().filter(|v| !v.is_empty()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn no_env() -> Option<HashMap<String, String>> {
        Some(HashMap::new())
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.retrieval.per_retriever_k, 20);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.retrieval.graph_score_scale, 3.0);
        assert_eq!(config.vector.backend, VectorBackend::Flat);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_file_overrides_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regmap.toml");
        fs::write(
            &path,
            r#"
[retrieval]
top_k = 5
use_hyde = false

[vector]
backend = "qdrant"
collection = "sections_test"
"#,
        )
        .unwrap();

        let config = Config::load_from(Some(&path), no_env()).unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert!(!config.retrieval.use_hyde);
        assert!(config.retrieval.use_vector);
        assert_eq!(config.vector.backend, VectorBackend::Qdrant);
        assert_eq!(config.vector.collection, "sections_test");
        assert_eq!(config.embedding.model, "text-embedding-3-small");
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regmap.toml");
        fs::write(&path, "[retrieval]\ntop_k = 5\n").unwrap();

        let env = HashMap::from([
            ("REGMAP_RETRIEVAL__TOP_K".to_string(), "7".to_string()),
            ("REGMAP_RETRIEVAL__USE_GRAPH".to_string(), "false".to_string()),
            ("REGMAP_INDEX__DIR".to_string(), "/tmp/regmap".to_string()),
        ]);
        let config = Config::load_from(Some(&path), Some(env)).unwrap();
        assert_eq!(config.retrieval.top_k, 7);
        assert!(!config.retrieval.use_graph);
        assert_eq!(config.index_dir(), PathBuf::from("/tmp/regmap"));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = Config::load_from(Some(Path::new("/nonexistent/regmap.toml")), no_env());
        assert!(err.is_err());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("regmap.toml");
        fs::write(&path, "[retrieval]\nper_retriever_k = 0\n").unwrap();
        assert!(Config::load_from(Some(&path), no_env()).is_err());

        let mut config = Config::default();
        config.generation.temperature = 3.5;
        assert_eq!(config.validate(), Err(ConfigError::Temperature(3.5)));

        let mut config = Config::default();
        config.retrieval.graph_score_scale = 0.0;
        assert_eq!(
            config.validate(),
            Err(ConfigError::NotPositive {
                field: "retrieval.graph_score_scale"
            })
        );
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.embedding.api_key = Some("${REGMAP_TEST_KEY}".to_string());
        let toml = config.to_toml_string().unwrap();
        assert!(toml.contains("[retrieval]"));

        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_resolve_api_key() {
        assert_eq!(
            resolve_api_key(&Some("direct-key".to_string()), ""),
            Some("direct-key".to_string())
        );
        assert_eq!(resolve_api_key(&Some("${REGMAP_UNSET_VAR_XYZ}".to_string()), ""), None);
        assert_eq!(resolve_api_key(&None, ""), None);
        assert_eq!(resolve_api_key(&Some(String::new()), "REGMAP_UNSET_VAR_XYZ"), None);
    }

    #[test]
    fn test_expand_path() {
        let expanded = expand_path("~/indexes");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert_eq!(expand_path("data/indexes"), PathBuf::from("data/indexes"));
    }

    #[test]
    fn test_expand_path_variables() {
        std::env::set_var("IDX_TEST_INDEX_ROOT", "/srv/regmap");
        assert_eq!(
            expand_path("$IDX_TEST_INDEX_ROOT/indexes"),
            PathBuf::from("/srv/regmap/indexes")
        );
        assert_eq!(
            expand_path("${IDX_TEST_INDEX_ROOT}/graph"),
            PathBuf::from("/srv/regmap/graph")
        );
        assert_eq!(
            expand_path("$IDX_TEST_UNSET_VARIABLE/indexes"),
            PathBuf::from("$IDX_TEST_UNSET_VARIABLE/indexes")
        );
    }

    #[test]
    fn test_config_serializes_to_json() {
        let json = serde_json::to_value(Config::default()).unwrap();
        assert_eq!(json["vector"]["backend"], "flat");
        assert_eq!(json["retrieval"]["use_lexical"], true);
    }
}
