// src/config.rs
//
// Runtime configuration: backend selection, credentials, limits and cache tuning.
// Loaded from the environment (plus an optional .env file) at startup.

use anyhow::{anyhow, bail, Context};
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_CACHE_SWEEP_INTERVAL, DEFAULT_CACHE_TTL, DEFAULT_MAX_UPLOAD_SIZE,
};
use crate::retry::RetryPolicy;
use crate::upload::UploadConfig;

/// Connection details for Azure Blob Storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureConfig {
    pub account: String,
    pub container: String,
    /// Full blob endpoint, e.g. an Azurite URL. Defaults to the public endpoint of `account`.
    pub endpoint: Option<String>,
}

impl AzureConfig {
    /// Parse `AccountName=...;AccountKey=...;BlobEndpoint=...` style connection strings.
    pub fn from_connection_string(connection_string: &str, container: &str) -> anyhow::Result<Self> {
        let mut account = None;
        let mut endpoint = None;
        for part in connection_string.split(';') {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            match key.trim() {
                "AccountName" => account = Some(value.trim().to_string()),
                "BlobEndpoint" => endpoint = Some(value.trim().trim_end_matches('/').to_string()),
                _ => {}
            }
        }
        let account = account
            .filter(|a| !a.is_empty())
            .ok_or_else(|| anyhow!("connection string has no AccountName"))?;
        if container.is_empty() {
            bail!("container name is empty");
        }
        Ok(Self {
            account,
            container: container.to_string(),
            endpoint,
        })
    }

    pub fn account_url(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.account))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    /// Ephemeral in-process store.
    Memory,
    /// Keys stored as files under `root`.
    File { root: PathBuf },
    /// Azure Blob Storage (requires the `azure-backend` feature).
    Azure(AzureConfig),
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub backend: BackendConfig,
    pub max_upload_size: u64,
    pub cache_ttl: Duration,
    pub cache_sweep_interval: Duration,
    pub retry: RetryPolicy,
    pub upload: UploadConfig,
    /// Parallel sub-operations for recursive delete, copy and rename.
    pub bulk_concurrency: usize,
}

impl StorageConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            cache_ttl: DEFAULT_CACHE_TTL,
            cache_sweep_interval: DEFAULT_CACHE_SWEEP_INTERVAL,
            retry: RetryPolicy::default(),
            upload: UploadConfig::default(),
            bulk_concurrency: crate::constants::DEFAULT_BULK_CONCURRENCY,
        }
    }

    /// Read configuration from the process environment, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let connection_string = get("AZURE_STORAGE_CONNECTION_STRING");
        let root = get("BLOBTREE_ROOT");
        let kind = match get("BLOBTREE_BACKEND") {
            Some(kind) => kind.to_ascii_lowercase(),
            None if connection_string.is_some() => "azure".to_string(),
            None if root.is_some() => "file".to_string(),
            None => bail!(
                "no storage backend configured: set BLOBTREE_BACKEND, BLOBTREE_ROOT or AZURE_STORAGE_CONNECTION_STRING"
            ),
        };

        let backend = match kind.as_str() {
            "memory" => BackendConfig::Memory,
            "file" => BackendConfig::File {
                root: PathBuf::from(root.context("BLOBTREE_ROOT is required for the file backend")?),
            },
            "azure" => {
                let cs = connection_string
                    .context("AZURE_STORAGE_CONNECTION_STRING is required for the azure backend")?;
                let container = get("AZURE_STORAGE_CONTAINER_NAME")
                    .context("AZURE_STORAGE_CONTAINER_NAME is required for the azure backend")?;
                BackendConfig::Azure(AzureConfig::from_connection_string(&cs, &container)?)
            }
            other => bail!("unknown BLOBTREE_BACKEND {other:?} (expected memory, file or azure)"),
        };

        let mut config = Self::new(backend);
        if let Some(v) = get("MAX_FILE_SIZE") {
            config.max_upload_size = v
                .trim()
                .parse()
                .with_context(|| format!("MAX_FILE_SIZE must be a byte count, got {v:?}"))?;
        }
        if let Some(v) = get("BLOBTREE_CACHE_TTL") {
            config.cache_ttl = humantime::parse_duration(v.trim())
                .with_context(|| format!("invalid BLOBTREE_CACHE_TTL {v:?}"))?;
        }
        if let Some(v) = get("BLOBTREE_CACHE_SWEEP") {
            config.cache_sweep_interval = humantime::parse_duration(v.trim())
                .with_context(|| format!("invalid BLOBTREE_CACHE_SWEEP {v:?}"))?;
        }
        if let Some(v) = get("BLOBTREE_RETRY_ATTEMPTS") {
            let attempts: u32 = v
                .trim()
                .parse()
                .with_context(|| format!("invalid BLOBTREE_RETRY_ATTEMPTS {v:?}"))?;
            config.retry.max_attempts = attempts.max(1);
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn azure_inferred_from_connection_string() {
        let cfg = StorageConfig::from_lookup(lookup(&[
            (
                "AZURE_STORAGE_CONNECTION_STRING",
                "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=c2VjcmV0;EndpointSuffix=core.windows.net",
            ),
            ("AZURE_STORAGE_CONTAINER_NAME", "uploads"),
            ("MAX_FILE_SIZE", "1048576"),
            ("BLOBTREE_CACHE_TTL", "10s"),
        ]))
        .unwrap();
        match &cfg.backend {
            BackendConfig::Azure(az) => {
                assert_eq!(az.account, "acct");
                assert_eq!(az.container, "uploads");
                assert_eq!(az.account_url(), "https://acct.blob.core.windows.net");
            }
            other => panic!("unexpected backend {other:?}"),
        }
        assert_eq!(cfg.max_upload_size, 1_048_576);
        assert_eq!(cfg.cache_ttl, Duration::from_secs(10));
        assert_eq!(cfg.cache_sweep_interval, DEFAULT_CACHE_SWEEP_INTERVAL);
    }

    #[test]
    fn blob_endpoint_overrides_account_url() {
        let az = AzureConfig::from_connection_string(
            "AccountName=devstoreaccount1;BlobEndpoint=http://127.0.0.1:10000/devstoreaccount1/",
            "c",
        )
        .unwrap();
        assert_eq!(az.account_url(), "http://127.0.0.1:10000/devstoreaccount1");
    }

    #[test]
    fn file_backend_and_defaults() {
        let cfg = StorageConfig::from_lookup(lookup(&[("BLOBTREE_ROOT", "/srv/blobs")])).unwrap();
        assert_eq!(
            cfg.backend,
            BackendConfig::File {
                root: PathBuf::from("/srv/blobs")
            }
        );
        assert_eq!(cfg.cache_ttl, DEFAULT_CACHE_TTL);
        assert_eq!(cfg.max_upload_size, DEFAULT_MAX_UPLOAD_SIZE);
        assert_eq!(cfg.retry.max_attempts, 5);
    }

    #[test]
    fn missing_or_bad_settings_are_reported() {
        assert!(StorageConfig::from_lookup(lookup(&[])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[("BLOBTREE_BACKEND", "tape")])).is_err());
        assert!(StorageConfig::from_lookup(lookup(&[
            ("BLOBTREE_BACKEND", "memory"),
            ("MAX_FILE_SIZE", "lots")
        ]))
        .is_err());
        assert!(AzureConfig::from_connection_string("AccountKey=abc", "c").is_err());
    }
}
