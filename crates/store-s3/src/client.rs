use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stowage_store::{RemoteStoreAdapter, StoreError};
use stowage_types::{ChunkDescriptor, ObjectId, StoredObjectMetadata};

/// Connection settings for an S3-compatible endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct S3Config {
    /// Custom endpoint, e.g. `https://s3.eu-central-1.wasabisys.com`.
    /// `None` uses the SDK's default AWS resolution.
    pub endpoint_url: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials. `None` falls back to the default provider chain.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Key prefix under which objects live.
    pub key_prefix: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint_url: None,
            region: "us-east-1".into(),
            bucket: String::new(),
            access_key_id: None,
            secret_access_key: None,
            key_prefix: "files/".into(),
        }
    }
}

/// State of one in-progress multipart upload.
struct PendingUpload {
    upload_id: String,
    /// ETags keyed by part number.
    parts: BTreeMap<i32, String>,
}

/// Outcome of registering a freshly created multipart upload.
enum Registration {
    /// No upload was pending; this one is now it.
    Kept(String),
    /// Another task registered first. `stale` must be aborted.
    Lost { winner: String, stale: String },
}

/// `RemoteStoreAdapter` backed by an S3-compatible bucket.
///
/// Key layout: `{prefix}{object_id}/data` for the object body,
/// `{prefix}{object_id}/meta.json` for the metadata record.
pub struct PrimaryObjectStore {
    name: String,
    client: S3Client,
    bucket: String,
    key_prefix: String,
    pending: Mutex<HashMap<String, PendingUpload>>,
}

impl PrimaryObjectStore {
    /// Builds a store from config, creating the SDK client.
    pub async fn connect(name: impl Into<String>, config: S3Config) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials =
                Credentials::new(access_key, secret_key, None, None, "stowage");
            loader = loader.credentials_provider(credentials);
        }

        if let Some(ref endpoint) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }

        let sdk_config = loader.load().await;
        let client = S3Client::new(&sdk_config);
        Self::from_client(name, client, config)
    }

    /// Builds a store from a pre-configured SDK client (for testing).
    pub fn from_client(name: impl Into<String>, client: S3Client, config: S3Config) -> Self {
        Self {
            name: name.into(),
            client,
            bucket: config.bucket,
            key_prefix: config.key_prefix,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn data_key(&self, object_id: &ObjectId) -> String {
        format!("{}{}/data", self.key_prefix, object_id)
    }

    fn meta_key(&self, object_id: &ObjectId) -> String {
        format!("{}{}/meta.json", self.key_prefix, object_id)
    }

    /// Starts a multipart upload for the object if none is pending.
    ///
    /// Concurrent first chunks can all pass the initial check before any
    /// create call returns; the first registration wins and every losing
    /// upload is aborted so none is left pending at the store.
    async fn ensure_pending(&self, object_id: &ObjectId) -> Result<String, StoreError> {
        {
            let pending = self.pending.lock().unwrap();
            if let Some(upload) = pending.get(object_id.as_str()) {
                return Ok(upload.upload_id.clone());
            }
        }

        let key = self.data_key(object_id);
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| StoreError::Other {
                message: format!("no upload id returned for {key}"),
            })?
            .to_string();

        match self.register_pending(object_id, upload_id) {
            Registration::Kept(id) => Ok(id),
            Registration::Lost { winner, stale } => {
                if let Err(e) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&key)
                    .upload_id(&stale)
                    .send()
                    .await
                {
                    warn!(
                        object_id = %object_id,
                        error = %e,
                        "failed to abort duplicate multipart upload"
                    );
                }
                Ok(winner)
            }
        }
    }

    /// Registers a freshly created upload id, unless one is already
    /// pending for the object.
    fn register_pending(&self, object_id: &ObjectId, upload_id: String) -> Registration {
        let mut pending = self.pending.lock().unwrap();
        if let Some(existing) = pending.get(object_id.as_str()) {
            return Registration::Lost {
                winner: existing.upload_id.clone(),
                stale: upload_id,
            };
        }
        pending.insert(
            object_id.to_string(),
            PendingUpload {
                upload_id: upload_id.clone(),
                parts: BTreeMap::new(),
            },
        );
        Registration::Kept(upload_id)
    }
}

#[async_trait]
impl RemoteStoreAdapter for PrimaryObjectStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_chunk(
        &self,
        object_id: &ObjectId,
        descriptor: &ChunkDescriptor,
        data: &[u8],
    ) -> Result<(), StoreError> {
        let upload_id = self.ensure_pending(object_id).await?;
        // S3 part numbers are 1-based.
        let part_number = (descriptor.sequence + 1) as i32;

        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.data_key(object_id))
            .upload_id(&upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data.to_vec()))
            .send()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        let mut pending = self.pending.lock().unwrap();
        if let Some(upload) = pending.get_mut(object_id.as_str()) {
            upload.parts.insert(part_number, etag);
        }
        debug!(object_id = %object_id, part_number, "uploaded part");
        Ok(())
    }

    async fn complete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let upload = {
            let mut pending = self.pending.lock().unwrap();
            pending
                .remove(object_id.as_str())
                .ok_or_else(|| StoreError::NoPendingUpload {
                    key: object_id.to_string(),
                })?
        };

        let parts: Vec<CompletedPart> = upload
            .parts
            .iter()
            .map(|(number, etag)| {
                CompletedPart::builder()
                    .part_number(*number)
                    .e_tag(etag)
                    .build()
            })
            .collect();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.data_key(object_id))
            .upload_id(&upload.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?;
        Ok(())
    }

    async fn abort_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        let upload = {
            let mut pending = self.pending.lock().unwrap();
            pending.remove(object_id.as_str())
        };
        let Some(upload) = upload else {
            return Ok(());
        };

        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.data_key(object_id))
            .upload_id(&upload.upload_id)
            .send()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?;
        debug!(object_id = %object_id, "aborted multipart upload");
        Ok(())
    }

    async fn get_range(
        &self,
        object_id: &ObjectId,
        start: u64,
        end: u64,
    ) -> Result<Vec<u8>, StoreError> {
        // Validate against the known size so a bad range surfaces as
        // RangeNotSatisfiable rather than an opaque 416 from the store.
        let size = self
            .head_object(object_id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                key: object_id.to_string(),
            })?;
        if start >= size {
            return Err(StoreError::RangeNotSatisfiable { start, size });
        }
        let end = end.min(size - 1);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.data_key(object_id))
            .range(format!("bytes={start}-{end}"))
            .send()
            .await
            .map_err(|err| {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    StoreError::NotFound {
                        key: object_id.to_string(),
                    }
                } else {
                    StoreError::transient(service_err.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?
            .into_bytes()
            .to_vec();
        Ok(data)
    }

    async fn head_object(&self, object_id: &ObjectId) -> Result<Option<u64>, StoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.data_key(object_id))
            .send()
            .await
        {
            Ok(output) => Ok(output.content_length().map(|l| l as u64)),
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_not_found() {
                    Ok(None)
                } else {
                    Err(StoreError::transient(service_err.to_string()))
                }
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<StoredObjectMetadata>, StoreError> {
        let list_prefix = format!("{}{}", self.key_prefix, prefix);
        let mut ids: Vec<String> = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&list_prefix)
                .delimiter("/");
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|e| StoreError::transient(e.to_string()))?;

            for common in response.common_prefixes() {
                if let Some(p) = common.prefix() {
                    // `{key_prefix}{object_id}/` -> object_id
                    let id = p
                        .trim_start_matches(&self.key_prefix)
                        .trim_end_matches('/');
                    if !id.is_empty() {
                        ids.push(id.to_string());
                    }
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        let mut metas = Vec::with_capacity(ids.len());
        for id in ids {
            let object_id = ObjectId::from(id);
            match self.get_metadata(&object_id).await {
                Ok(Some(meta)) => metas.push(meta),
                Ok(None) => {}
                Err(e) => {
                    warn!(object_id = %object_id, error = %e, "skipping unreadable metadata");
                }
            }
        }
        Ok(metas)
    }

    async fn delete_object(&self, object_id: &ObjectId) -> Result<(), StoreError> {
        for key in [self.data_key(object_id), self.meta_key(object_id)] {
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&key)
                .send()
                .await
                .map_err(|e| StoreError::transient(e.to_string()))?;
        }
        Ok(())
    }

    async fn put_metadata(&self, meta: &StoredObjectMetadata) -> Result<(), StoreError> {
        let body = serde_json::to_vec(meta).map_err(|e| StoreError::Other {
            message: format!("metadata encode failed: {e}"),
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.meta_key(&meta.object_id))
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?;
        Ok(())
    }

    async fn get_metadata(
        &self,
        object_id: &ObjectId,
    ) -> Result<Option<StoredObjectMetadata>, StoreError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.meta_key(object_id))
            .send()
            .await
        {
            Ok(r) => r,
            Err(err) => {
                let service_err = err.into_service_error();
                if service_err.is_no_such_key() {
                    return Ok(None);
                }
                return Err(StoreError::transient(service_err.to_string()));
            }
        };

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::transient(e.to_string()))?
            .into_bytes();
        let meta = serde_json::from_slice(&bytes).map_err(|e| StoreError::Other {
            message: format!("metadata decode failed: {e}"),
        })?;
        Ok(Some(meta))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> PrimaryObjectStore {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .credentials_provider(Credentials::new("test", "test", None, None, "test"))
            .load()
            .await;
        PrimaryObjectStore::from_client(
            "wasabi",
            S3Client::new(&sdk_config),
            S3Config {
                bucket: "test-bucket".into(),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn key_layout() {
        let store = test_store().await;
        let id = ObjectId::from("abc-123");
        assert_eq!(store.data_key(&id), "files/abc-123/data");
        assert_eq!(store.meta_key(&id), "files/abc-123/meta.json");
    }

    #[tokio::test]
    async fn abort_without_pending_is_a_no_op() {
        let store = test_store().await;
        // No multipart upload was started, so nothing to abort and no
        // network call is made.
        store
            .abort_object(&ObjectId::from("missing"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn complete_without_pending_fails() {
        let store = test_store().await;
        let err = store
            .complete_object(&ObjectId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NoPendingUpload { .. }));
    }

    #[tokio::test]
    async fn duplicate_upload_registrations_keep_the_first() {
        let store = test_store().await;
        let id = ObjectId::from("abc-123");

        // Two chunk tasks racing past the empty-map check both create an
        // upload; only the first registration may survive.
        let first = store.register_pending(&id, "upload-1".into());
        assert!(matches!(first, Registration::Kept(ref kept) if kept == "upload-1"));

        let second = store.register_pending(&id, "upload-2".into());
        match second {
            Registration::Lost { winner, stale } => {
                assert_eq!(winner, "upload-1");
                assert_eq!(stale, "upload-2");
            }
            Registration::Kept(_) => panic!("second registration must lose"),
        }

        // The pending map still points at the winner.
        let pending = store.pending.lock().unwrap();
        assert_eq!(pending.get("abc-123").unwrap().upload_id, "upload-1");
    }

    #[test]
    fn config_defaults() {
        let config = S3Config::default();
        assert_eq!(config.key_prefix, "files/");
        assert_eq!(config.region, "us-east-1");
        assert!(config.endpoint_url.is_none());
    }
}
