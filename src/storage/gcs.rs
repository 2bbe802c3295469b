use async_trait::async_trait;
use bytes::Bytes;
use google_cloud_auth::credentials::CredentialsFile;
use google_cloud_auth::error::Error as AuthError;
use google_cloud_storage::client::{Client, ClientConfig};
use google_cloud_storage::http::buckets::get::GetBucketRequest;
use google_cloud_storage::http::objects::upload::{Media, UploadObjectRequest, UploadType};
use google_cloud_storage::http::Error as GcsError;
use google_cloud_storage::sign::{SignBy, SignedURLOptions};
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;

use crate::config::{expand_home, Properties, Validation};
use crate::error::{classify_status, Result, StorageError};
use crate::storage::{
    content_type_for, object_key, ByteReader, StorageProvider, Vendor, SIGNED_URL_TTL,
};

#[derive(Debug, Clone)]
pub struct GcsConfig {
    pub credentials_path: PathBuf,
    pub project_id: String,
    pub bucket: String,
    pub base_path: String,
}

impl GcsConfig {
    /// Reads `storageprovider.gcp.*`.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut validation = Validation::new();
        let credentials_path = validation.require_file(
            properties,
            "storageprovider.gcp.credentialspath",
            "credentials",
        );
        let project_id = validation.require(properties, "storageprovider.gcp.projectid");
        let bucket = validation.require(properties, "storageprovider.gcp.bucketname");

        validation.finish((|| {
            Some(Self {
                credentials_path: credentials_path?,
                project_id: project_id?.to_string(),
                bucket: bucket?.to_string(),
                base_path: properties.get_or("storageprovider.gcp.basepath", "").to_string(),
            })
        })())
    }
}

/// Google Cloud Storage uploads with V4 signed URLs.
///
/// Construction stays offline: the authenticated client is created on first use.
/// With a service-account file, URLs are signed locally with its private key; the
/// ambient constructor signs through the IAM `signBlob` API instead.
pub struct GcsStorage {
    credentials: Option<CredentialsFile>,
    signer: Option<Client>,
    client: OnceCell<Client>,
    project_id: String,
    bucket: String,
    base_path: String,
}

impl GcsStorage {
    pub async fn new(config: GcsConfig) -> Result<Self> {
        let credentials_path = config.credentials_path.to_string_lossy().into_owned();
        let credentials = CredentialsFile::new_from_file(credentials_path)
            .await
            .map_err(|e| {
                StorageError::Configuration(format!("Failed to load GCS credentials: {}", e))
            })?;

        let signer = match (&credentials.client_email, &credentials.private_key) {
            (Some(email), Some(key)) => Some(Client::new(ClientConfig {
                default_google_access_id: Some(email.clone()),
                default_sign_by: Some(SignBy::PrivateKey(key.clone().into_bytes())),
                project_id: Some(config.project_id.clone()),
                ..ClientConfig::default().anonymous()
            })),
            _ => None,
        };

        Ok(Self {
            credentials: Some(credentials),
            signer,
            client: OnceCell::new(),
            project_id: config.project_id,
            bucket: config.bucket,
            base_path: config.base_path,
        })
    }

    pub async fn with_credentials_file(
        credentials_path: &str,
        project_id: String,
        bucket: String,
        base_path: String,
    ) -> Result<Self> {
        Self::new(GcsConfig {
            credentials_path: expand_home(credentials_path),
            project_id,
            bucket,
            base_path,
        })
        .await
    }

    /// Uses `GOOGLE_APPLICATION_CREDENTIALS` or the metadata server.
    pub fn from_env(project_id: String, bucket: String, base_path: String) -> Self {
        Self {
            credentials: None,
            signer: None,
            client: OnceCell::new(),
            project_id,
            bucket,
            base_path,
        }
    }

    pub async fn from_properties(properties: &Properties) -> Result<Self> {
        Self::new(GcsConfig::from_properties(properties)?).await
    }

    /// Authenticated client, fetching the first token on demand.
    async fn client(&self) -> Result<&Client> {
        self.client
            .get_or_try_init(|| async {
                let client_config = match &self.credentials {
                    Some(credentials) => {
                        ClientConfig::default()
                            .with_credentials(credentials.clone())
                            .await
                    }
                    None => ClientConfig::default().with_auth().await,
                };
                let mut client_config = client_config.map_err(classify_auth_error)?;
                client_config.project_id = Some(self.project_id.clone());
                tracing::debug!(bucket = %self.bucket, "GCS client authenticated");
                Ok::<_, StorageError>(Client::new(client_config))
            })
            .await
    }

    fn upload_request(&self) -> UploadObjectRequest {
        UploadObjectRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        }
    }

    fn media(object_name: &str, file_name: &str, length: u64) -> UploadType {
        let mut media = Media::new(object_name.to_string());
        media.content_type = content_type_for(file_name).into();
        media.content_length = Some(length);
        UploadType::Simple(media)
    }

    async fn signed_url(&self, object_name: &str) -> Result<String> {
        let options = SignedURLOptions {
            expires: SIGNED_URL_TTL,
            ..Default::default()
        };

        let client = match &self.signer {
            Some(signer) => signer,
            None => self.client().await?,
        };

        client
            .signed_url(&self.bucket, object_name, None, None, options)
            .await
            .map_err(|e| StorageError::Authentication(format!("Failed to sign GCS URL: {}", e)))
    }

    fn upload_failed(
        &self,
        error: GcsError,
        object_name: &str,
        length: u64,
        start: Instant,
    ) -> StorageError {
        let error = classify_gcs_error(error, "Failed to upload to GCS");
        tracing::error!(
            error = %error,
            bucket = %self.bucket,
            key = %object_name,
            size_bytes = length,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GCS upload failed"
        );
        error
    }

    async fn finish_upload(
        &self,
        object_name: &str,
        length: u64,
        start: Instant,
    ) -> Result<String> {
        let url = self.signed_url(object_name).await?;

        tracing::info!(
            bucket = %self.bucket,
            key = %object_name,
            size_bytes = length,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "GCS upload successful"
        );

        Ok(url)
    }
}

fn classify_auth_error(error: AuthError) -> StorageError {
    let message = format!("Failed to authenticate with GCS: {}", error);
    match &error {
        AuthError::HttpError(e) if e.is_timeout() || e.is_connect() => {
            StorageError::TransientNetwork(message)
        }
        AuthError::HttpError(e) => match e.status() {
            Some(status) => classify_status(status.as_u16(), message),
            None => StorageError::TransientNetwork(message),
        },
        _ => StorageError::Authentication(message),
    }
}

fn classify_gcs_error(error: GcsError, context: &str) -> StorageError {
    let message = format!("{}: {}", context, error);
    match &error {
        GcsError::Response(response) => classify_status(response.code, message),
        GcsError::HttpClient(e) if e.is_timeout() || e.is_connect() => {
            StorageError::TransientNetwork(message)
        }
        GcsError::TokenSource(_) => StorageError::Authentication(message),
        _ => StorageError::PermanentUpload(message),
    }
}

#[async_trait]
impl StorageProvider for GcsStorage {
    fn name(&self) -> &'static str {
        Vendor::Gcp.property_namespace()
    }

    async fn verify(&self) -> Result<()> {
        let request = GetBucketRequest {
            bucket: self.bucket.clone(),
            ..Default::default()
        };

        match self.client().await?.get_bucket(&request).await {
            Ok(_) => Ok(()),
            Err(GcsError::Response(response)) if response.code == 404 => {
                Err(StorageError::BucketNotFound(format!(
                    "A bucket with the name {} does not exist in project {}",
                    self.bucket, self.project_id
                )))
            }
            Err(e) => Err(classify_gcs_error(e, "Failed to check GCS bucket")),
        }
    }

    /// Single-shot media upload of the whole buffer.
    async fn put(&self, data: Bytes, file_name: &str, job_id: &str) -> Result<String> {
        let object_name = object_key(&self.base_path, job_id, file_name);
        let length = data.len() as u64;
        let start = Instant::now();

        self.client()
            .await?
            .upload_object(
                &self.upload_request(),
                data,
                &Self::media(&object_name, file_name, length),
            )
            .await
            .map_err(|e| self.upload_failed(e, &object_name, length, start))?;

        self.finish_upload(&object_name, length, start).await
    }

    async fn put_stream(
        &self,
        reader: ByteReader,
        length: u64,
        file_name: &str,
        job_id: &str,
    ) -> Result<String> {
        let object_name = object_key(&self.base_path, job_id, file_name);
        let start = Instant::now();

        let stream = ReaderStream::new(reader.take(length));

        let object = self
            .client()
            .await?
            .upload_streamed_object(
                &self.upload_request(),
                stream,
                &Self::media(&object_name, file_name, length),
            )
            .await
            .map_err(|e| self.upload_failed(e, &object_name, length, start))?;

        if (object.size as u64) < length {
            return Err(StorageError::PermanentUpload(format!(
                "Payload ended after {} of {} declared bytes",
                object.size, length
            )));
        }

        self.finish_upload(&object_name, length, start).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gcs_config_from_properties() {
        let dir = tempfile::TempDir::new().unwrap();
        let creds = dir.path().join("creds.json");
        std::fs::write(&creds, "{}").unwrap();

        let props: Properties = [
            ("storageprovider.gcp.credentialspath", creds.to_str().unwrap()),
            ("storageprovider.gcp.projectid", "my-project"),
            ("storageprovider.gcp.bucketname", "out"),
            ("storageprovider.gcp.basepath", "reports"),
        ]
        .into_iter()
        .collect();

        let config = GcsConfig::from_properties(&props).unwrap();
        assert_eq!(config.credentials_path, creds);
        assert_eq!(config.project_id, "my-project");
        assert_eq!(config.bucket, "out");
        assert_eq!(config.base_path, "reports");
    }

    #[test]
    fn test_gcs_config_reports_every_problem() {
        let props: Properties = [(
            "storageprovider.gcp.credentialspath",
            "/definitely/not/here/creds.json",
        )]
        .into_iter()
        .collect();

        match GcsConfig::from_properties(&props) {
            Err(StorageError::Configuration(message)) => {
                assert!(message.contains(
                    "storageprovider.gcp.credentialspath must point to a valid credentials file"
                ));
                assert!(message.contains("storageprovider.gcp.projectid must have a value"));
                assert!(message.contains("storageprovider.gcp.bucketname must have a value"));
            }
            other => panic!("expected configuration error, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_gcs_rejects_malformed_credentials_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let creds = dir.path().join("creds.json");
        std::fs::write(&creds, "not json").unwrap();

        let result = GcsStorage::new(GcsConfig {
            credentials_path: creds,
            project_id: "my-project".to_string(),
            bucket: "out".to_string(),
            base_path: String::new(),
        })
        .await;

        assert!(matches!(result, Err(StorageError::Configuration(_))));
    }

    fn write_service_account(dir: &tempfile::TempDir) -> PathBuf {
        let creds = dir.path().join("service-account.json");
        let json = serde_json::json!({
            "type": "service_account",
            "project_id": "my-project",
            "private_key_id": "key-1",
            "private_key": include_str!("testdata/service_account_key.pem"),
            "client_email": "uploader@my-project.iam.gserviceaccount.com",
            "client_id": "1234",
            "token_uri": "https://oauth2.googleapis.com/token"
        });
        std::fs::write(&creds, json.to_string()).unwrap();
        creds
    }

    #[tokio::test]
    async fn test_gcs_construction_is_offline_and_signs_locally() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage = GcsStorage::new(GcsConfig {
            credentials_path: write_service_account(&dir),
            project_id: "my-project".to_string(),
            bucket: "out".to_string(),
            base_path: String::new(),
        })
        .await
        .unwrap();

        assert!(storage.client.get().is_none());

        let url = storage
            .signed_url(&object_key(&storage.base_path, "job-123", "a.zip"))
            .await
            .unwrap();

        assert!(url.starts_with("https://storage.googleapis.com/out/job-123/a.zip?"));
        assert!(url.contains("X-Goog-Algorithm=GOOG4-RSA-SHA256"));
        assert!(url.contains("X-Goog-Expires=1800"));
        assert!(url.contains("X-Goog-Signature="));
        assert!(storage.client.get().is_none());
    }

    #[tokio::test]
    async fn test_token_fetch_failures_are_classified() {
        let refused = reqwest::Client::new()
            .get("http://127.0.0.1:1/token")
            .send()
            .await
            .unwrap_err();
        assert!(classify_auth_error(AuthError::HttpError(refused)).is_retryable());

        let rejected = AuthError::DeserializeError("invalid_grant".to_string());
        assert!(matches!(
            classify_auth_error(rejected),
            StorageError::Authentication(_)
        ));
    }
}
