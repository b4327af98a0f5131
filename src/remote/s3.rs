// sitevault/src/remote/s3.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use chrono::Utc;
use s3::config::Region;
use s3::presigning::PresigningConfig;
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use super::{Phase, RemoteBackupDescriptor, RemoteStatus, RemoteStore};
use crate::config::StorageConfig;
use crate::errors::{transport, Result, VaultError};
use crate::operation::Metadata;

const DESCRIPTOR_NAME: &str = "descriptor.json";
const PRESIGNED_URL_TTL: Duration = Duration::from_secs(6 * 3600);

/// Remote store on an S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO).
///
/// Layout: `<prefix>/<backupkey>/descriptor.json` plus one object per phase.
pub struct S3RemoteStore {
    client: s3::Client,
    config: StorageConfig,
}

impl S3RemoteStore {
    pub async fn connect(config: StorageConfig) -> Self {
        let sdk_config = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,     // session_token
                None,     // expiry
                "Static", // provider_name
            ))
            .load()
            .await;

        S3RemoteStore {
            client: s3::Client::new(&sdk_config),
            config,
        }
    }

    fn root_prefix(&self) -> String {
        match self.config.folder_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/", prefix),
            _ => String::new(),
        }
    }

    fn object_key(&self, backupkey: &str, name: &str) -> String {
        format!("{}{}/{}", self.root_prefix(), backupkey, name)
    }

    async fn put_descriptor(&self, descriptor: &RemoteBackupDescriptor) -> Result<()> {
        let body = serde_json::to_vec_pretty(descriptor)?;
        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(self.object_key(&descriptor.backupkey, DESCRIPTOR_NAME))
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| transport("Failed to write backup descriptor", e))?;
        Ok(())
    }

    /// Total size of every object stored under one backup key.
    async fn stored_size(&self, backupkey: &str) -> Result<u64> {
        let prefix = format!("{}{}/", self.root_prefix(), backupkey);
        let mut total = 0u64;
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(&prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| transport("Failed to list backup objects", e))?;
            for object in page.contents() {
                if object.key().is_some_and(|k| k.ends_with(DESCRIPTOR_NAME)) {
                    continue;
                }
                total += object.size().unwrap_or(0).max(0) as u64;
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }
        Ok(total)
    }

    async fn multipart_upload(&self, key: &str, source: &Path) -> Result<u64> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .send()
            .await
            .map_err(|e| transport(&format!("Failed to start multipart upload of {}", key), e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| VaultError::Transport(format!("No upload id returned for {}", key)))?
            .to_string();

        match self.upload_parts(key, &upload_id, source).await {
            Ok(size) => Ok(size),
            Err(e) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.config.bucket_name)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!("Could not abort multipart upload of {}: {}", key, abort_err);
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(&self, key: &str, upload_id: &str, source: &Path) -> Result<u64> {
        let chunk_size = self.config.chunk_size_bytes as usize;
        let mut file = tokio::fs::File::open(source).await?;
        let mut parts = Vec::new();
        let mut total = 0u64;
        let mut part_number = 1i32;

        loop {
            let mut buffer = Vec::with_capacity(chunk_size);
            let read = (&mut file).take(chunk_size as u64).read_to_end(&mut buffer).await?;
            if read == 0 {
                break;
            }
            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.config.bucket_name)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(buffer))
                .send()
                .await
                .map_err(|e| transport(&format!("Failed to upload part {} of {}", part_number, key), e))?;
            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            total += read as u64;
            tracing::debug!("Uploaded part {} of {} ({} bytes so far)", part_number, key, total);
            part_number += 1;
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| transport(&format!("Failed to complete multipart upload of {}", key), e))?;
        Ok(total)
    }
}

#[async_trait]
impl RemoteStore for S3RemoteStore {
    async fn check_credentials(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket_name)
            .send()
            .await
            .map_err(|e| {
                transport(
                    &format!(
                        "Could not access bucket '{}' at {}",
                        self.config.bucket_name, self.config.endpoint_url
                    ),
                    e,
                )
            })?;
        Ok(())
    }

    async fn announce(&self, metadata: &Metadata) -> Result<String> {
        if let Some(quota) = self.config.max_backups {
            let existing = self
                .list()
                .await?
                .into_iter()
                .filter(|d| d.status != RemoteStatus::Failed)
                .count();
            if existing >= quota {
                return Err(VaultError::PolicyViolation(format!(
                    "Backup quota reached ({} of {} backups stored)",
                    existing, quota
                )));
            }
        }

        let descriptor = RemoteBackupDescriptor {
            backupkey: uuid::Uuid::new_v4().simple().to_string(),
            status: RemoteStatus::InProgress,
            timecreated: Utc::now(),
            timefinished: None,
            metadata: metadata.clone(),
            size_bytes: 0,
        };
        self.put_descriptor(&descriptor).await?;
        Ok(descriptor.backupkey)
    }

    async fn upload(&self, backupkey: &str, phase: Phase, source: &Path) -> Result<u64> {
        let key = self.object_key(backupkey, phase.file_name());
        let size = tokio::fs::metadata(source).await?.len();
        if size > self.config.chunk_size_bytes {
            return self.multipart_upload(&key, source).await;
        }

        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| VaultError::FatalLocal(format!("Cannot read {}: {}", source.display(), e)))?;
        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(&key)
            .body(body)
            .send()
            .await
            .map_err(|e| transport(&format!("Failed to upload {}", key), e))?;
        Ok(size)
    }

    async fn download_url(&self, backupkey: &str, phase: Phase) -> Result<String> {
        let presigning = PresigningConfig::expires_in(PRESIGNED_URL_TTL)
            .map_err(|e| VaultError::Config(format!("Invalid presigning settings: {}", e)))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(self.object_key(backupkey, phase.file_name()))
            .presigned(presigning)
            .await
            .map_err(|e| transport(&format!("Failed to sign download of {}", phase), e))?;
        Ok(request.uri().to_string())
    }

    async fn get_descriptor(&self, backupkey: &str) -> Result<RemoteBackupDescriptor> {
        let object = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(self.object_key(backupkey, DESCRIPTOR_NAME))
            .send()
            .await
            .map_err(|e| transport(&format!("Backup {} is not available", backupkey), e))?;
        let bytes = object
            .body
            .collect()
            .await
            .map_err(|e| transport("Failed to read backup descriptor", e))?
            .into_bytes();
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn list(&self) -> Result<Vec<RemoteBackupDescriptor>> {
        let root = self.root_prefix();
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(&root)
                .delimiter("/")
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| transport("Failed to list backups", e))?;
            for common in page.common_prefixes() {
                if let Some(prefix) = common.prefix() {
                    let key = prefix.trim_start_matches(root.as_str()).trim_end_matches('/');
                    if !key.is_empty() {
                        keys.push(key.to_string());
                    }
                }
            }
            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        let mut descriptors = Vec::with_capacity(keys.len());
        for key in keys {
            match self.get_descriptor(&key).await {
                Ok(descriptor) => descriptors.push(descriptor),
                Err(e) => tracing::warn!("Skipping backup {} without readable descriptor: {}", key, e),
            }
        }
        descriptors.sort_by(|a, b| b.timecreated.cmp(&a.timecreated));
        Ok(descriptors)
    }

    async fn patch_status(&self, backupkey: &str, status: RemoteStatus) -> Result<()> {
        let mut descriptor = self.get_descriptor(backupkey).await?;
        descriptor.status = status;
        if status == RemoteStatus::Finished {
            descriptor.timefinished = Some(Utc::now());
            descriptor.size_bytes = self.stored_size(backupkey).await?;
        }
        self.put_descriptor(&descriptor).await
    }
}
