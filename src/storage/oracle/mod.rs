mod profile;
mod signer;

pub use profile::{OciProfile, DEFAULT_CONFIG_PATH, DEFAULT_PROFILE};
pub use signer::RequestSigner;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::config::{expand_home, Properties, Validation};
use crate::error::{classify_status, Result, StorageError};
use crate::storage::{
    content_type_for, object_key, ByteReader, StorageProvider, Vendor, SIGNED_URL_TTL,
};

/// Path-segment encoding: everything but unreserved characters, including `/`.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone)]
pub struct OracleConfig {
    pub config_file: PathBuf,
    pub profile: String,
    pub region: String,
    pub namespace: String,
    pub bucket: String,
    pub base_path: String,
}

impl OracleConfig {
    /// Reads `storageprovider.oracle.*`.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut validation = Validation::new();
        let config_file = validation.require_file(
            properties,
            "storageprovider.oracle.ociconfigfilepath",
            "config",
        );
        let region = validation.require_region(properties, "storageprovider.oracle.region");
        let namespace = validation.require(properties, "storageprovider.oracle.namespace");
        let bucket = validation.require(properties, "storageprovider.oracle.bucketname");

        validation.finish((|| {
            Some(Self {
                config_file: config_file?,
                profile: properties
                    .get_or("storageprovider.oracle.profile", DEFAULT_PROFILE)
                    .to_string(),
                region: region?.to_string(),
                namespace: namespace?.to_string(),
                bucket: bucket?.to_string(),
                base_path: properties
                    .get_or("storageprovider.oracle.basepath", "")
                    .to_string(),
            })
        })())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreatePreauthenticatedRequestDetails<'a> {
    name: String,
    object_name: &'a str,
    access_type: &'static str,
    time_expires: DateTime<Utc>,
    bucket_listing_action: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PreauthenticatedRequest {
    access_uri: String,
}

/// Oracle Object Storage uploads; the download URL is a pre-authenticated request.
pub struct OracleStorage {
    http: reqwest::Client,
    signer: RequestSigner,
    endpoint: String,
    namespace: String,
    bucket: String,
    base_path: String,
}

impl OracleStorage {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let profile = OciProfile::load(&config.config_file, &config.profile)?;
        let signer = RequestSigner::from_profile(&profile)?;

        Ok(Self::with_signer(
            regional_endpoint(&config.region),
            signer,
            config.namespace,
            config.bucket,
            config.base_path,
        ))
    }

    pub fn with_signer(
        endpoint: String,
        signer: RequestSigner,
        namespace: String,
        bucket: String,
        base_path: String,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            signer,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            namespace,
            bucket,
            base_path,
        }
    }

    /// Uses the `DEFAULT` profile of `~/.oci/config`.
    pub fn from_default_config(
        region: String,
        namespace: String,
        bucket: String,
        base_path: String,
    ) -> Result<Self> {
        Self::new(OracleConfig {
            config_file: expand_home(DEFAULT_CONFIG_PATH),
            profile: DEFAULT_PROFILE.to_string(),
            region,
            namespace,
            bucket,
            base_path,
        })
    }

    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Self::new(OracleConfig::from_properties(properties)?)
    }

    fn bucket_url(&self) -> String {
        format!(
            "{}/n/{}/b/{}",
            self.endpoint,
            utf8_percent_encode(&self.namespace, SEGMENT),
            utf8_percent_encode(&self.bucket, SEGMENT)
        )
    }

    fn object_url(&self, object_name: &str) -> String {
        format!(
            "{}/o/{}",
            self.bucket_url(),
            utf8_percent_encode(object_name, SEGMENT)
        )
    }

    /// Signs and sends one request, mapping transport failures only.
    async fn execute(
        &self,
        builder: RequestBuilder,
        sign_body: bool,
        context: &str,
    ) -> Result<Response> {
        let mut request = builder
            .build()
            .map_err(|e| StorageError::PermanentUpload(format!("{}: {}", context, e)))?;
        self.signer.sign(&mut request, sign_body, Utc::now())?;

        let response = self.http.execute(request).await.map_err(|e| {
            let message = format!("{}: {}", context, e);
            if e.is_timeout() || e.is_connect() {
                StorageError::TransientNetwork(message)
            } else {
                StorageError::PermanentUpload(message)
            }
        })?;

        Ok(response)
    }

    /// Like `execute`, but a non-success status becomes an error.
    async fn send(
        &self,
        builder: RequestBuilder,
        sign_body: bool,
        context: &str,
    ) -> Result<Response> {
        let response = self.execute(builder, sign_body, context).await?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(status_error(response, context).await)
    }

    /// Creates an object-read PAR for `object_name` and returns its full URL.
    pub async fn signed_url(&self, object_name: &str) -> Result<String> {
        let details = par_details(object_name, Utc::now())?;
        let body = serde_json::to_vec(&details)
            .map_err(|e| StorageError::PermanentUpload(format!("Failed to encode PAR: {}", e)))?;

        let builder = self
            .http
            .post(format!("{}/p/", self.bucket_url()))
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let par: PreauthenticatedRequest = self
            .send(builder, true, "Failed to create pre-authenticated request")
            .await?
            .json()
            .await
            .map_err(|e| {
                StorageError::PermanentUpload(format!("Failed to read PAR response: {}", e))
            })?;

        Ok(format!("{}{}", self.endpoint, par.access_uri))
    }
}

fn par_details(
    object_name: &str,
    now: DateTime<Utc>,
) -> Result<CreatePreauthenticatedRequestDetails<'_>> {
    let expires = chrono::Duration::from_std(SIGNED_URL_TTL)
        .map_err(|e| StorageError::Configuration(format!("Invalid URL lifetime: {}", e)))?;

    Ok(CreatePreauthenticatedRequestDetails {
        name: format!("Converted file {} Download", object_name),
        object_name,
        access_type: "ObjectRead",
        time_expires: now + expires,
        bucket_listing_action: "Deny",
    })
}

async fn status_error(response: Response, context: &str) -> StorageError {
    let status = response.status();
    let detail = response.text().await.unwrap_or_default();
    classify_status(status.as_u16(), format!("{}: {} {}", context, status, detail))
}

fn regional_endpoint(region: &str) -> String {
    format!("https://objectstorage.{}.oraclecloud.com", region)
}

#[async_trait]
impl StorageProvider for OracleStorage {
    fn name(&self) -> &'static str {
        Vendor::Oracle.property_namespace()
    }

    async fn verify(&self) -> Result<()> {
        let context = format!("Failed to get bucket {}", self.bucket);
        let response = self
            .execute(self.http.get(self.bucket_url()), false, &context)
            .await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(StorageError::BucketNotFound(format!(
                "A bucket with the name {} does not exist in namespace {}",
                self.bucket, self.namespace
            ))),
            _ => Err(status_error(response, &context).await),
        }
    }

    async fn put_stream(
        &self,
        reader: ByteReader,
        length: u64,
        file_name: &str,
        job_id: &str,
    ) -> Result<String> {
        let key = object_key(&self.base_path, job_id, file_name);
        let start = Instant::now();

        let body = Body::wrap_stream(ReaderStream::new(reader.take(length)));
        let builder = self
            .http
            .put(self.object_url(&key))
            .header(CONTENT_TYPE, content_type_for(file_name))
            .header(CONTENT_LENGTH, length)
            .body(body);

        if let Err(error) = self
            .send(builder, false, "Failed to upload to Oracle Object Storage")
            .await
        {
            tracing::error!(
                error = %error,
                bucket = %self.bucket,
                key = %key,
                size_bytes = length,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "Oracle upload failed"
            );
            return Err(error);
        }

        let url = self.signed_url(&key).await?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = length,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Oracle upload successful"
        );

        Ok(url)
    }
}
