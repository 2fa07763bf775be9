// src/azure_client.rs
//
// Azure Blob Storage backend (feature "azure-backend"). Block blobs in one container.

use async_stream::try_stream;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{stream::FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use azure_core::credentials::TokenCredential;
use azure_core::http::{Body, NoFormat, RequestContent, XmlFormat};
use azure_identity::DefaultAzureCredential;

use azure_storage_blob::clients::{
    BlobClient, BlobClientOptions, BlobContainerClient, BlobContainerClientOptions,
    BlockBlobClient,
};
use azure_storage_blob::models::{
    BlobClientDownloadOptions, BlobClientGetPropertiesOptions,
    BlobClientGetPropertiesResultHeaders, BlobContainerClientListBlobFlatSegmentOptions,
    BlockBlobClientCommitBlockListOptions, BlockBlobClientStageBlockOptions,
    BlockBlobClientUploadOptions, BlockLookupList, ListBlobsFlatSegmentResponse,
};

use crate::config::AzureConfig;
use crate::constants::{AZURE_PUT_BLOCK_SIZE, AZURE_SINGLE_SHOT_LIMIT};
use crate::error::{Result, StorageError};
use crate::object_store::{
    BlockId, ObjectEntry, ObjectProperties, ObjectStore, ObjectStream, PutOptions, PutReceipt,
};

// Authenticate once per process.
static AZURE_CREDENTIAL: OnceCell<Arc<dyn TokenCredential>> = OnceCell::const_new();

/// Map SDK failures onto the crate taxonomy. Throttling, timeouts and server errors are transient.
fn classify(key: &str, e: azure_core::Error) -> StorageError {
    match e.http_status().map(u16::from) {
        Some(404) => StorageError::NotFound(key.to_string()),
        Some(401) | Some(403) => StorageError::PermissionDenied(format!("{key}: {e}")),
        Some(408) | Some(429) => StorageError::Transient(anyhow::Error::new(e)),
        Some(code) if code >= 500 => StorageError::Transient(anyhow::Error::new(e)),
        Some(_) => StorageError::Internal(anyhow::Error::new(e)),
        // No status: connection-level failure.
        None => StorageError::Transient(anyhow::Error::new(e)),
    }
}

/// SDK timestamps are `time::OffsetDateTime`; convert without depending on `time` directly.
macro_rules! to_chrono {
    ($ts:expr) => {
        DateTime::<Utc>::from_timestamp($ts.unix_timestamp(), $ts.nanosecond())
    };
}

/// Block blobs in one container, authenticated with the default Entra ID credential chain.
#[derive(Clone)]
pub struct AzureObjectStore {
    account_url: String,
    container: String,
    credential: Arc<dyn TokenCredential>,
}

impl AzureObjectStore {
    pub async fn from_config(config: &AzureConfig) -> Result<Self> {
        let credential = AZURE_CREDENTIAL
            .get_or_try_init(|| async {
                let credential: Arc<dyn TokenCredential> = DefaultAzureCredential::new()?;
                Ok::<_, anyhow::Error>(credential)
            })
            .await?;
        debug!(
            "azure store for container {} at {}",
            config.container,
            config.account_url()
        );
        Ok(Self {
            account_url: config.account_url(),
            container: config.container.clone(),
            credential: Arc::clone(credential),
        })
    }

    fn container_client(&self) -> Result<BlobContainerClient> {
        BlobContainerClient::new(
            &self.account_url,
            self.container.clone(),
            self.credential.clone(),
            Some(BlobContainerClientOptions::default()),
        )
        .map_err(|e| classify(&self.container, e))
    }

    fn blob_client(&self, key: &str) -> Result<BlobClient> {
        BlobClient::new(
            &self.account_url,
            self.container.clone(),
            key.to_string(),
            self.credential.clone(),
            Some(BlobClientOptions::default()),
        )
        .map_err(|e| classify(key, e))
    }

    fn block_blob_client(&self, key: &str) -> Result<BlockBlobClient> {
        Ok(self.blob_client(key)?.block_blob_client())
    }

    fn metadata_option(options: &PutOptions) -> Option<HashMap<String, String>> {
        (!options.metadata.is_empty()).then(|| options.metadata.clone())
    }

    async fn put_single_shot(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<()> {
        let blob = self.blob_client(key)?;
        let content_len = data.len() as u64;
        let body: RequestContent<Bytes, NoFormat> = Body::from(data).into();
        let opts = BlockBlobClientUploadOptions {
            blob_content_type: Some(options.content_type.clone()),
            metadata: Self::metadata_option(options),
            ..Default::default()
        };
        blob.upload(body, true, content_len, Some(opts))
            .await
            .map_err(|e| classify(key, e))?;
        Ok(())
    }

    /// Large bodies go up as parallel sub-blocks, bounded by `options.concurrency`.
    async fn put_staged(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<()> {
        let max_in_flight = options.concurrency.max(1);
        let mut in_flight = FuturesUnordered::new();
        let mut ids = Vec::new();

        for (idx, offset) in (0..data.len()).step_by(AZURE_PUT_BLOCK_SIZE).enumerate() {
            let end = (offset + AZURE_PUT_BLOCK_SIZE).min(data.len());
            let id = BlockId::from_index(idx);
            ids.push(id.clone());

            if in_flight.len() >= max_in_flight {
                if let Some(res) = in_flight.next().await {
                    res?;
                }
            }
            let chunk = data.slice(offset..end);
            in_flight.push(async move { self.stage_block(key, &id, chunk).await });
        }
        while let Some(res) = in_flight.next().await {
            res?;
        }
        trace!("azure put {} staged as {} sub-blocks", key, ids.len());
        self.commit_blocks(key, &ids, options).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for AzureObjectStore {
    async fn put(&self, key: &str, data: Bytes, options: &PutOptions) -> Result<PutReceipt> {
        if data.len() > AZURE_SINGLE_SHOT_LIMIT && options.concurrency > 1 {
            self.put_staged(key, data, options).await?;
        } else {
            self.put_single_shot(key, data, options).await?;
        }
        let props = self.get_properties(key).await?;
        Ok(PutReceipt {
            etag: props.etag,
            last_modified: props.last_modified.unwrap_or_else(Utc::now),
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        let blob = self.blob_client(key)?;
        let resp = blob
            .download(Some(BlobClientDownloadOptions::default()))
            .await
            .map_err(|e| classify(key, e))?;
        resp.into_raw_body()
            .collect()
            .await
            .map_err(|e| classify(key, e))
    }

    async fn get_properties(&self, key: &str) -> Result<ObjectProperties> {
        let blob = self.blob_client(key)?;
        let resp = blob
            .get_properties(Some(BlobClientGetPropertiesOptions::default()))
            .await
            .map_err(|e| classify(key, e))?;
        let header = |e| classify(key, e);
        Ok(ObjectProperties {
            size: resp.content_length().map_err(header)?.unwrap_or(0),
            content_type: resp.content_type().map_err(header)?,
            last_modified: resp
                .last_modified()
                .map_err(header)?
                .and_then(|ts| to_chrono!(ts)),
            etag: resp.etag().map_err(header)?.map(|e| e.to_string()),
            metadata: resp.metadata().map_err(header)?,
        })
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let blob = self.blob_client(key)?;
        blob.delete(None).await.map_err(|e| classify(key, e))?;
        Ok(())
    }

    fn list_after<'a>(&'a self, prefix: &'a str, start_after: Option<String>) -> ObjectStream<'a> {
        Box::pin(try_stream! {
            let container = self.container_client()?;
            let mut opts = BlobContainerClientListBlobFlatSegmentOptions::default();
            if !prefix.is_empty() {
                opts.prefix = Some(prefix.to_string());
            }
            let mut pager = container
                .list_blobs(Some(opts))
                .map_err(|e| classify(prefix, e))?;

            // The service has no start-after filter, so earlier keys are skipped here.
            while let Some(page) = pager.next().await {
                let resp = page.map_err(|e| classify(prefix, e))?;
                let body: ListBlobsFlatSegmentResponse =
                    resp.into_body().await.map_err(|e| classify(prefix, e))?;
                for item in body.segment.blob_items {
                    let Some(key) = item.name.and_then(|n| n.content) else {
                        continue;
                    };
                    if start_after.as_deref().is_some_and(|after| key.as_str() <= after) {
                        continue;
                    }
                    let props = item.properties;
                    yield ObjectEntry {
                        key,
                        size: props.as_ref().and_then(|p| p.content_length).unwrap_or(0),
                        content_type: props.as_ref().and_then(|p| p.content_type.clone()),
                        last_modified: props
                            .as_ref()
                            .and_then(|p| p.last_modified)
                            .and_then(|ts| to_chrono!(ts)),
                    };
                }
            }
        })
    }

    async fn stage_block(&self, key: &str, block_id: &BlockId, data: Bytes) -> Result<()> {
        let bb = self.block_blob_client(key)?;
        let content_len = data.len() as u64;
        let body: RequestContent<Bytes, NoFormat> = Body::from(data).into();
        // Raw id bytes; the SDK base64-encodes them on the wire.
        bb.stage_block(
            block_id.as_bytes(),
            content_len,
            body,
            Some(BlockBlobClientStageBlockOptions::default()),
        )
        .await
        .map_err(|e| classify(key, e))?;
        Ok(())
    }

    async fn commit_blocks(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &PutOptions,
    ) -> Result<PutReceipt> {
        let bb = self.block_blob_client(key)?;
        let lookup = BlockLookupList {
            committed: None,
            latest: Some(block_ids.iter().map(|id| id.as_bytes().to_vec()).collect()),
            uncommitted: None,
        };
        let body: RequestContent<BlockLookupList, XmlFormat> =
            lookup.try_into().map_err(|e| classify(key, e))?;
        let opts = BlockBlobClientCommitBlockListOptions {
            blob_content_type: Some(options.content_type.clone()),
            metadata: Self::metadata_option(options),
            ..Default::default()
        };
        bb.commit_block_list(body, Some(opts))
            .await
            .map_err(|e| classify(key, e))?;
        debug!("azure commit {} ({} blocks)", key, block_ids.len());
        Ok(PutReceipt {
            etag: None,
            last_modified: Utc::now(),
        })
    }

    /// Uncommitted blocks have no delete call; the service garbage-collects them after a week.
    async fn discard_blocks(&self, key: &str) -> Result<()> {
        trace!("azure leaves uncommitted blocks of {} to expire", key);
        Ok(())
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}/{}", self.account_url, self.container, key)
    }
}
