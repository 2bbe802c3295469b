use async_trait::async_trait;
use azure_core::error::{Error as AzureError, ErrorKind};
use azure_storage::shared_access_signature::service_sas::BlobSasPermissions;
use azure_storage::StorageCredentials;
use azure_storage_blobs::prelude::*;
use base64::Engine;
use std::time::Instant;
use time::OffsetDateTime;

use crate::config::{Properties, Validation};
use crate::error::{classify_status, Result, StorageError};
use crate::storage::{
    content_type_for, object_key, read_payload, ByteReader, StorageProvider, Vendor,
    SIGNED_URL_TTL,
};

pub const ACCOUNT_ENV: &str = "AZURE_STORAGE_ACCOUNT";
pub const ACCESS_KEY_ENV: &str = "AZURE_STORAGE_KEY";

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub account: String,
    pub access_key: String,
    pub container: String,
    pub base_path: String,
}

impl AzureConfig {
    /// Reads `storageprovider.azure.*`.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut validation = Validation::new();
        let account = validation.require(properties, "storageprovider.azure.accountname");
        let access_key = validation.require(properties, "storageprovider.azure.accountkey");
        let container = validation.require(properties, "storageprovider.azure.containername");

        if let Some(key) = access_key {
            if base64::engine::general_purpose::STANDARD.decode(key).is_err() {
                validation.problem("storageprovider.azure.accountkey must be a base64 encoded key");
            }
        }

        validation.finish((|| {
            Some(Self {
                account: account?.to_string(),
                access_key: access_key?.to_string(),
                container: container?.to_string(),
                base_path: properties.get_or("storageprovider.azure.basepath", "").to_string(),
            })
        })())
    }
}

/// Azure Blob Storage uploads with read-only SAS URLs.
pub struct AzureStorage {
    service_client: BlobServiceClient,
    container_client: ContainerClient,
    account: String,
    container: String,
    base_path: String,
}

impl AzureStorage {
    pub fn new(config: AzureConfig) -> Self {
        let credentials = StorageCredentials::access_key(config.account.clone(), config.access_key);
        Self::with_credentials(config.account, credentials, config.container, config.base_path)
    }

    /// SAS signing only works with access-key credentials; other kinds can upload but
    /// fail when the URL is minted.
    pub fn with_credentials(
        account: String,
        credentials: StorageCredentials,
        container: String,
        base_path: String,
    ) -> Self {
        let service_client = BlobServiceClient::new(account.clone(), credentials);
        let container_client = service_client.container_client(container.clone());

        Self {
            service_client,
            container_client,
            account,
            container,
            base_path,
        }
    }

    /// Reads the account and key from `AZURE_STORAGE_ACCOUNT` and `AZURE_STORAGE_KEY`.
    pub fn from_env(container: String, base_path: String) -> Result<Self> {
        let account = std::env::var(ACCOUNT_ENV)
            .map_err(|_| StorageError::Configuration(format!("{} must be set", ACCOUNT_ENV)))?;
        let access_key = std::env::var(ACCESS_KEY_ENV)
            .map_err(|_| StorageError::Configuration(format!("{} must be set", ACCESS_KEY_ENV)))?;

        Ok(Self::new(AzureConfig {
            account,
            access_key,
            container,
            base_path,
        }))
    }

    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self::new(AzureConfig::from_properties(properties)?))
    }

    /// Creates the container, tolerating one that already exists.
    async fn ensure_container(&self) -> Result<()> {
        match self.container_client.create().await {
            Ok(_) => Ok(()),
            Err(e) if is_container_already_exists(&e) => Ok(()),
            Err(e) => Err(classify_azure_error(e, "Failed to create container")),
        }
    }

    /// Builds a read-only SAS URL for `blob_name`, valid for [`SIGNED_URL_TTL`].
    pub async fn signed_url(&self, blob_name: &str) -> Result<String> {
        let blob_client = self.container_client.blob_client(blob_name);

        let permissions = BlobSasPermissions {
            read: true,
            ..Default::default()
        };
        let expiry =
            OffsetDateTime::now_utc() + time::Duration::seconds(SIGNED_URL_TTL.as_secs() as i64);

        let sas = blob_client
            .shared_access_signature(permissions, expiry)
            .await
            .map_err(|e| {
                StorageError::Authentication(format!("Failed to create SAS token: {}", e))
            })?;

        let url = blob_client
            .generate_signed_blob_url(&sas)
            .map_err(|e| StorageError::PermanentUpload(format!("Failed to build blob URL: {}", e)))?;

        Ok(url.to_string())
    }
}

fn is_container_already_exists(error: &AzureError) -> bool {
    matches!(
        error.kind(),
        ErrorKind::HttpResponse { error_code: Some(code), .. } if code == "ContainerAlreadyExists"
    )
}

fn classify_azure_error(error: AzureError, context: &str) -> StorageError {
    let message = format!("{}: {}", context, error);
    match error.kind() {
        ErrorKind::HttpResponse { status, .. } => classify_status(*status as u16, message),
        ErrorKind::Io => StorageError::TransientNetwork(message),
        ErrorKind::Credential => StorageError::Authentication(message),
        _ => StorageError::PermanentUpload(message),
    }
}

#[async_trait]
impl StorageProvider for AzureStorage {
    fn name(&self) -> &'static str {
        Vendor::Azure.property_namespace()
    }

    async fn verify(&self) -> Result<()> {
        self.service_client
            .get_account_information()
            .await
            .map(|_| ())
            .map_err(|e| {
                classify_azure_error(
                    e,
                    &format!("Failed to fetch account information for {}", self.account),
                )
            })
    }

    async fn put_stream(
        &self,
        reader: ByteReader,
        length: u64,
        file_name: &str,
        job_id: &str,
    ) -> Result<String> {
        let blob_name = object_key(&self.base_path, job_id, file_name);
        let start = Instant::now();

        if let Err(error) = self.ensure_container().await {
            tracing::error!(
                error = %error,
                container = %self.container,
                "Azure container creation failed"
            );
            return Err(error);
        }

        let data = read_payload(reader, length).await?;

        // Download under the bare filename rather than the job-scoped blob name.
        self.container_client
            .blob_client(&blob_name)
            .put_block_blob(data)
            .content_type(content_type_for(file_name))
            .content_disposition(format!("attachment; filename={}", file_name))
            .await
            .map_err(|e| {
                let error = classify_azure_error(e, "Failed to upload to Azure Blob");
                tracing::error!(
                    error = %error,
                    container = %self.container,
                    key = %blob_name,
                    size_bytes = length,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Azure upload failed"
                );
                error
            })?;

        let url = self.signed_url(&blob_name).await?;

        tracing::info!(
            container = %self.container,
            key = %blob_name,
            size_bytes = length,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Azure upload successful"
        );

        Ok(url)
    }
}
