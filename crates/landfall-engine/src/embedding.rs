//! Embedding strategies.
//!
//! A table flagged for embedding gets a fixed-width vector column computed from
//! the text of its `vectorize` columns. The provider is chosen explicitly from
//! an [`EmbeddingRegistry`] keyed by provider name; configuration is passed in,
//! never read from the environment.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use landfall_types::error::{DestinationError, Result};

/// Maps text to fixed-width vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed many texts, preserving order.
    ///
    /// Default implementation calls `embed` for each text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Output dimension of every vector.
    fn dimension(&self) -> usize;

    /// Model identifier.
    fn model_name(&self) -> &str;
}

/// Explicit provider configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_provider() -> String {
    HASHING_PROVIDER.to_string()
}

fn default_model() -> String {
    "feature-hash-v1".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_max_retries() -> u32 {
    3
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            dimensions: default_dimensions(),
            api_key: None,
            max_retries: default_max_retries(),
        }
    }
}

/// Name of the built-in offline provider.
pub const HASHING_PROVIDER: &str = "hashing";

type ProviderFactory =
    Box<dyn Fn(&EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync>;

/// Provider factories keyed by name.
pub struct EmbeddingRegistry {
    factories: HashMap<String, ProviderFactory>,
}

impl EmbeddingRegistry {
    /// Registry with no providers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory, replacing any previous one under the same name.
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the provider named by `config.provider`.
    ///
    /// # Errors
    ///
    /// Returns a `config` error for unknown providers, zero dimensions, or a
    /// provider whose dimension disagrees with the configuration.
    pub fn create(&self, config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
        if config.dimensions == 0 {
            return Err(DestinationError::config(
                "INVALID_EMBEDDING_CONFIG",
                "embedding dimensions must be positive",
            ));
        }
        let factory = self.factories.get(&config.provider).ok_or_else(|| {
            DestinationError::config(
                "UNKNOWN_EMBEDDING_PROVIDER",
                format!(
                    "embedding provider '{}' is not registered (known: {})",
                    config.provider,
                    self.providers().join(", ")
                ),
            )
        })?;
        let provider = factory(config)?;
        if provider.dimension() != config.dimensions {
            return Err(DestinationError::config(
                "INVALID_EMBEDDING_CONFIG",
                format!(
                    "provider '{}' produces {} dimensions, configured {}",
                    config.provider,
                    provider.dimension(),
                    config.dimensions
                ),
            ));
        }
        tracing::info!(
            provider = %config.provider,
            model = %provider.model_name(),
            dimensions = config.dimensions,
            "embedding provider selected"
        );
        Ok(provider)
    }
}

impl Default for EmbeddingRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(HASHING_PROVIDER, |config| {
            Ok(Arc::new(HashingEmbedder::new(config.model.clone(), config.dimensions))
                as Arc<dyn EmbeddingProvider>)
        });
        registry
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each lowercase word token is hashed into a bucket with a signed weight and
/// the result is L2-normalised. Needs no model files or network access.
pub struct HashingEmbedder {
    model: String,
    dimensions: usize,
}

impl HashingEmbedder {
    #[must_use]
    pub fn new(model: impl Into<String>, dimensions: usize) -> Self {
        Self {
            model: model.into(),
            dimensions,
        }
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0_f32; self.dimensions];
        if self.dimensions == 0 {
            return vector;
        }
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let digest = Sha256::digest(token.to_lowercase().as_bytes());
            let mut bucket_bytes = [0_u8; 8];
            bucket_bytes.copy_from_slice(&digest[..8]);
            let bucket = u64::from_le_bytes(bucket_bytes) % self.dimensions as u64;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket as usize] += sign;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_sync(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
