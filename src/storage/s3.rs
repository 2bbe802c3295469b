use async_trait::async_trait;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::{DisplayErrorContext, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use std::time::Instant;

use crate::config::{Properties, Validation};
use crate::error::{classify_status, Result, StorageError};
use crate::storage::{
    content_type_for, object_key, read_payload, ByteReader, StorageProvider, Vendor,
    SIGNED_URL_TTL,
};

/// Where an S3-compatible client sends its requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Endpoint {
    /// Regional AWS endpoint resolved by the SDK.
    Aws,
    /// `https://{region}.digitaloceanspaces.com`
    DigitalOcean,
}

impl S3Endpoint {
    pub fn url(&self, region: &str) -> Option<String> {
        match self {
            S3Endpoint::Aws => None,
            S3Endpoint::DigitalOcean => Some(format!("https://{}.digitaloceanspaces.com", region)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub base_path: String,
    pub endpoint: S3Endpoint,
}

impl S3Config {
    /// Reads `storageprovider.aws.*`.
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let mut validation = Validation::new();
        let region = validation.require_region(properties, "storageprovider.aws.region");
        let access_key = validation.require(properties, "storageprovider.aws.accesskey");
        let secret_key = validation.require(properties, "storageprovider.aws.secretkey");
        let bucket = validation.require(properties, "storageprovider.aws.bucketname");

        validation.finish((|| {
            Some(Self {
                region: region?.to_string(),
                access_key: access_key?.to_string(),
                secret_key: secret_key?.to_string(),
                bucket: bucket?.to_string(),
                base_path: properties.get_or("storageprovider.aws.basepath", "").to_string(),
                endpoint: S3Endpoint::Aws,
            })
        })())
    }

    /// Reads `storageprovider.do.*`.
    pub fn digital_ocean_from_properties(properties: &Properties) -> Result<Self> {
        let mut validation = Validation::new();
        let region = validation.require(properties, "storageprovider.do.region");
        let access_key = validation.require(properties, "storageprovider.do.accesskey");
        let secret_key = validation.require(properties, "storageprovider.do.secretkey");
        let bucket = validation.require(properties, "storageprovider.do.bucketname");

        validation.finish((|| {
            Some(Self {
                region: region?.to_string(),
                access_key: access_key?.to_string(),
                secret_key: secret_key?.to_string(),
                bucket: bucket?.to_string(),
                base_path: properties.get_or("storageprovider.do.basepath", "").to_string(),
                endpoint: S3Endpoint::DigitalOcean,
            })
        })())
    }
}

/// S3 and S3-compatible (DigitalOcean Spaces) uploads with presigned GET URLs.
pub struct S3Storage {
    client: Client,
    vendor: Vendor,
    bucket: String,
    base_path: String,
}

impl S3Storage {
    pub fn new(config: S3Config) -> Self {
        let credentials = Credentials::new(
            config.access_key,
            config.secret_key,
            None,
            None,
            "storageprovider",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint_url) = config.endpoint.url(&config.region) {
            builder = builder.endpoint_url(endpoint_url);
        }

        Self {
            client: Client::from_conf(builder.build()),
            vendor: vendor_for(&config.endpoint),
            bucket: config.bucket,
            base_path: config.base_path,
        }
    }

    pub fn with_credentials(
        region: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        base_path: String,
    ) -> Self {
        Self::new(S3Config {
            region,
            access_key,
            secret_key,
            bucket,
            base_path,
            endpoint: S3Endpoint::Aws,
        })
    }

    pub fn digital_ocean(
        region: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        base_path: String,
    ) -> Self {
        Self::new(S3Config {
            region,
            access_key,
            secret_key,
            bucket,
            base_path,
            endpoint: S3Endpoint::DigitalOcean,
        })
    }

    /// Uses the SDK's default credential chain (`AWS_ACCESS_KEY_ID`, profiles, IMDS, ...).
    pub async fn from_env(
        region: String,
        bucket: String,
        base_path: String,
        endpoint: S3Endpoint,
    ) -> Self {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region.clone()));

        if let Some(endpoint_url) = endpoint.url(&region) {
            config_loader = config_loader.endpoint_url(endpoint_url);
        }

        let config = config_loader.load().await;

        Self {
            client: Client::new(&config),
            vendor: vendor_for(&endpoint),
            bucket,
            base_path,
        }
    }

    pub fn from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self::new(S3Config::from_properties(properties)?))
    }

    pub fn digital_ocean_from_properties(properties: &Properties) -> Result<Self> {
        Ok(Self::new(S3Config::digital_ocean_from_properties(properties)?))
    }

    /// Presigns a GET for `key`, valid for [`SIGNED_URL_TTL`]. No request is sent.
    pub async fn signed_url(&self, key: &str) -> Result<String> {
        let presigning = PresigningConfig::expires_in(SIGNED_URL_TTL)
            .map_err(|e| StorageError::Configuration(format!("Invalid presign expiry: {}", e)))?;

        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
            .map_err(|e| classify_sdk_error(e, "Failed to presign S3 URL"))?;

        Ok(request.uri().to_string())
    }
}

fn vendor_for(endpoint: &S3Endpoint) -> Vendor {
    match endpoint {
        S3Endpoint::Aws => Vendor::Aws,
        S3Endpoint::DigitalOcean => Vendor::DigitalOcean,
    }
}

fn classify_sdk_error<E>(error: SdkError<E, HttpResponse>, context: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{}: {}", context, DisplayErrorContext(&error));
    match &error {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::TransientNetwork(message)
        }
        SdkError::ServiceError(service) => classify_status(service.raw().status().as_u16(), message),
        _ => StorageError::PermanentUpload(message),
    }
}

#[async_trait]
impl StorageProvider for S3Storage {
    fn name(&self) -> &'static str {
        self.vendor.property_namespace()
    }

    async fn verify(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(404) => {
                Err(StorageError::BucketNotFound(format!(
                    "A bucket with the name {} does not exist",
                    self.bucket
                )))
            }
            Err(e) => Err(classify_sdk_error(e, "Failed to check bucket")),
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

        let data = read_payload(reader, length).await?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type_for(file_name))
            .content_length(data.len() as i64)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                let error = classify_sdk_error(e, "Failed to upload to S3");
                tracing::error!(
                    error = %error,
                    provider = self.name(),
                    bucket = %self.bucket,
                    key = %key,
                    size_bytes = length,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                error
            })?;

        let url = self.signed_url(&key).await?;

        tracing::info!(
            provider = self.name(),
            bucket = %self.bucket,
            key = %key,
            size_bytes = length,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(url)
    }
}
