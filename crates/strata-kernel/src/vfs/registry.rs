//! Backend type registry.
//!
//! Maps a `type` string from storage parameters to a factory producing a
//! [`StorageBackend`]. The registry is an ordinary value built at startup and
//! passed to whoever constructs backends.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::backends::{CachedBackend, LocalBackend, MemoryBackend};
use super::error::{FsError, FsResult};
use super::ops::StorageBackend;

/// Backend construction parameters.
///
/// `type` selects the factory; everything else is backend-specific and kept
/// as raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageParams {
    /// Registry key (e.g. "memory", "local").
    #[serde(rename = "type")]
    pub backend_type: String,

    /// Wrap the backend in a [`CachedBackend`] with this TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_ms: Option<u64>,

    /// Backend-specific parameters.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl StorageParams {
    /// Create params for a backend type with no extra fields.
    pub fn new(backend_type: impl Into<String>) -> Self {
        Self {
            backend_type: backend_type.into(),
            cache_ttl_ms: None,
            params: Map::new(),
        }
    }

    /// Set a backend-specific parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Enable the caching wrapper.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_ms = Some(ttl.as_millis() as u64);
        self
    }

    /// Required string parameter.
    pub fn str_param(&self, key: &str) -> FsResult<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FsError::invalid_argument(format!(
                    "{} backend requires string parameter '{}'",
                    self.backend_type, key
                ))
            })
    }

    /// Optional boolean parameter, false when absent.
    pub fn bool_param(&self, key: &str) -> bool {
        self.params.get(key).and_then(Value::as_bool).unwrap_or(false)
    }
}

/// Factory building a backend from params and the read-only flag.
pub type BackendFactory =
    Box<dyn Fn(&StorageParams, bool) -> FsResult<Arc<dyn StorageBackend>> + Send + Sync>;

/// Registry of backend factories keyed by type string.
pub struct BackendRegistry {
    factories: BTreeMap<String, BackendFactory>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with the built-in `memory` and `local` backends.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("memory", |_params, read_only| {
            let backend = if read_only {
                MemoryBackend::read_only()
            } else {
                MemoryBackend::new()
            };
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry.register("local", |params, read_only| {
            let root = params.str_param("path")?;
            let backend = LocalBackend::new(root)
                .with_read_only(read_only)
                .with_split_children(params.bool_param("split_children"));
            Ok(Arc::new(backend) as Arc<dyn StorageBackend>)
        });
        registry
    }

    /// Register (or replace) a factory.
    pub fn register<F>(&mut self, backend_type: impl Into<String>, factory: F)
    where
        F: Fn(&StorageParams, bool) -> FsResult<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        self.factories.insert(backend_type.into(), Box::new(factory));
    }

    /// Registered type names, sorted.
    pub fn types(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build a backend, applying the caching wrapper when requested.
    pub fn build(
        &self,
        params: &StorageParams,
        read_only: bool,
    ) -> FsResult<Arc<dyn StorageBackend>> {
        let factory = self.factories.get(&params.backend_type).ok_or_else(|| {
            FsError::not_supported(format!("unknown backend type '{}'", params.backend_type))
        })?;
        let backend = factory(params, read_only)?;
        Ok(match params.cache_ttl_ms {
            Some(ms) => Arc::new(CachedBackend::new(backend, Duration::from_millis(ms))),
            None => backend,
        })
    }
}
