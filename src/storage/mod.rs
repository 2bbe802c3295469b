pub mod azure;
pub mod gcs;
pub mod oracle;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::{Properties, PROVIDER_KEY};
use crate::error::{Result, StorageError};

use self::azure::AzureStorage;
use self::gcs::GcsStorage;
use self::oracle::OracleStorage;
use self::s3::S3Storage;

/// How long every issued download URL stays valid.
pub const SIGNED_URL_TTL: Duration = Duration::from_secs(30 * 60);

/// Content type assumed when the filename does not reveal one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/zip";

/// A readable upload payload.
pub type ByteReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

/// Uploads a finished conversion artifact and hands back a time-limited download URL.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short vendor label used in logs.
    fn name(&self) -> &'static str;

    /// Confirms the configured bucket/account is reachable with the configured credentials.
    async fn verify(&self) -> Result<()>;

    /// Stores `data` under `{basepath}/{job_id}/{file_name}` and returns a signed URL.
    async fn put(&self, data: Bytes, file_name: &str, job_id: &str) -> Result<String> {
        let length = data.len() as u64;
        self.put_stream(Box::new(Cursor::new(data)), length, file_name, job_id)
            .await
    }

    /// Streams exactly `length` bytes from `reader` and returns a signed URL.
    async fn put_stream(
        &self,
        reader: ByteReader,
        length: u64,
        file_name: &str,
        job_id: &str,
    ) -> Result<String>;
}

/// Builds the object key for one upload; `base_path` is dropped when empty.
pub fn object_key(base_path: &str, job_id: &str, file_name: &str) -> String {
    if base_path.is_empty() {
        format!("{}/{}", job_id, file_name)
    } else {
        format!("{}/{}/{}", base_path, job_id, file_name)
    }
}

pub fn content_type_for(file_name: &str) -> String {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}

/// Reads exactly `length` bytes; a reader that ends early fails the upload.
pub async fn read_payload(reader: ByteReader, length: u64) -> Result<Bytes> {
    let mut buffer = Vec::new();
    reader.take(length).read_to_end(&mut buffer).await?;

    if (buffer.len() as u64) < length {
        return Err(StorageError::PermanentUpload(format!(
            "Payload ended after {} of {} declared bytes",
            buffer.len(),
            length
        )));
    }

    Ok(Bytes::from(buffer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Gcp,
    Aws,
    Azure,
    Oracle,
    DigitalOcean,
}

impl Vendor {
    /// Segment used in the `storageprovider.{vendor}.*` property namespace.
    pub fn property_namespace(&self) -> &'static str {
        match self {
            Vendor::Gcp => "gcp",
            Vendor::Aws => "aws",
            Vendor::Azure => "azure",
            Vendor::Oracle => "oracle",
            Vendor::DigitalOcean => "do",
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.property_namespace())
    }
}

impl FromStr for Vendor {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gcp" | "google" => Ok(Vendor::Gcp),
            "aws" | "s3" => Ok(Vendor::Aws),
            "azure" => Ok(Vendor::Azure),
            "oracle" | "oci" => Ok(Vendor::Oracle),
            "do" | "digitalocean" => Ok(Vendor::DigitalOcean),
            other => Err(StorageError::Configuration(format!(
                "{} has been set to an unknown storage provider: {}",
                PROVIDER_KEY, other
            ))),
        }
    }
}

/// Constructs the provider selected by `storageprovider` without touching the network.
pub async fn from_properties(properties: &Properties) -> Result<Arc<dyn StorageProvider>> {
    let vendor: Vendor = properties
        .get(PROVIDER_KEY)
        .ok_or_else(|| {
            StorageError::Configuration(format!("{} must have a value", PROVIDER_KEY))
        })?
        .parse()?;

    tracing::info!(vendor = %vendor, "Initializing storage provider");

    let provider: Arc<dyn StorageProvider> = match vendor {
        Vendor::Gcp => Arc::new(GcsStorage::from_properties(properties).await?),
        Vendor::Aws => Arc::new(S3Storage::from_properties(properties)?),
        Vendor::DigitalOcean => Arc::new(S3Storage::digital_ocean_from_properties(properties)?),
        Vendor::Azure => Arc::new(AzureStorage::from_properties(properties)?),
        Vendor::Oracle => Arc::new(OracleStorage::from_properties(properties)?),
    };

    Ok(provider)
}

/// Constructs the configured provider and checks it can reach its bucket.
pub async fn connect(properties: &Properties) -> Result<Arc<dyn StorageProvider>> {
    let provider = from_properties(properties).await?;
    provider.verify().await?;
    tracing::info!(provider = provider.name(), "Storage provider verified");
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::SystemTime;

    type HmacSha256 = Hmac<Sha256>;

    /// In-memory provider that issues HMAC-signed URLs and enforces their expiry on fetch.
    struct MemoryStorage {
        bucket: String,
        base_path: String,
        secret: Vec<u8>,
        objects: Mutex<HashMap<String, Bytes>>,
    }

    impl MemoryStorage {
        fn new(bucket: &str, base_path: &str) -> Self {
            Self {
                bucket: bucket.to_string(),
                base_path: base_path.to_string(),
                secret: b"test-secret".to_vec(),
                objects: Mutex::new(HashMap::new()),
            }
        }

        fn signature(&self, key: &str, expires: u64) -> String {
            let mut mac = HmacSha256::new_from_slice(&self.secret).unwrap();
            mac.update(format!("{}\n{}", key, expires).as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }

        fn sign(&self, key: &str, now: u64) -> String {
            let expires = now + SIGNED_URL_TTL.as_secs();
            format!(
                "https://{}.storage.test/{}?expires={}&signature={}",
                self.bucket,
                key,
                expires,
                self.signature(key, expires)
            )
        }

        fn fetch(&self, url: &str, now: u64) -> Option<Bytes> {
            let rest = url.strip_prefix(&format!("https://{}.storage.test/", self.bucket))?;
            let (key, query) = rest.split_once('?')?;
            let params: HashMap<&str, &str> =
                query.split('&').filter_map(|p| p.split_once('=')).collect();
            let expires: u64 = params.get("expires")?.parse().ok()?;

            if now >= expires || params.get("signature")? != &self.signature(key, expires) {
                return None;
            }
            self.objects.lock().unwrap().get(key).cloned()
        }
    }

    fn now_secs() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    #[async_trait]
    impl StorageProvider for MemoryStorage {
        fn name(&self) -> &'static str {
            "memory"
        }

        async fn verify(&self) -> Result<()> {
            Ok(())
        }

        async fn put_stream(
            &self,
            reader: ByteReader,
            length: u64,
            file_name: &str,
            job_id: &str,
        ) -> Result<String> {
            let data = read_payload(reader, length).await?;
            let key = object_key(&self.base_path, job_id, file_name);
            self.objects.lock().unwrap().insert(key.clone(), data);
            Ok(self.sign(&key, now_secs()))
        }
    }

    #[test]
    fn test_object_key() {
        assert_eq!(object_key("", "job-123", "a.zip"), "job-123/a.zip");
        assert_eq!(object_key("reports", "job-123", "a.zip"), "reports/job-123/a.zip");
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a.zip"), "application/zip");
        assert_eq!(content_type_for("page.html"), "text/html");
        assert_eq!(content_type_for("output"), DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn test_vendor_parsing() {
        assert_eq!("GCP".parse::<Vendor>().unwrap(), Vendor::Gcp);
        assert_eq!("s3".parse::<Vendor>().unwrap(), Vendor::Aws);
        assert_eq!("digitalocean".parse::<Vendor>().unwrap(), Vendor::DigitalOcean);
        assert_eq!(" oci ".parse::<Vendor>().unwrap(), Vendor::Oracle);
        assert_eq!(Vendor::DigitalOcean.to_string(), "do");
        assert!(matches!(
            "ftp".parse::<Vendor>(),
            Err(StorageError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_read_payload_rejects_short_stream() {
        let reader: ByteReader = Box::new(Cursor::new(Bytes::from_static(b"abc")));
        let result = read_payload(reader, 5).await;
        assert!(matches!(result, Err(StorageError::PermanentUpload(_))));

        let reader: ByteReader = Box::new(Cursor::new(Bytes::from_static(b"abcdef")));
        assert_eq!(read_payload(reader, 4).await.unwrap(), Bytes::from_static(b"abcd"));

        let reader: ByteReader = Box::new(Cursor::new(Bytes::from_static(b"abc")));
        let result = read_payload(reader, u64::MAX).await;
        assert!(matches!(result, Err(StorageError::PermanentUpload(_))));
    }

    #[tokio::test]
    async fn test_put_stores_and_signs() {
        let storage = MemoryStorage::new("out", "");

        let url = storage
            .put(Bytes::from_static(b"hello"), "a.zip", "job-123")
            .await
            .unwrap();

        assert!(url.starts_with("https://out.storage.test/job-123/a.zip?"));
        assert_eq!(
            storage.fetch(&url, now_secs()).unwrap(),
            Bytes::from_static(b"hello")
        );
    }

    #[tokio::test]
    async fn test_signed_url_expires_after_thirty_minutes() {
        let storage = MemoryStorage::new("out", "reports");
        let url = storage
            .put(Bytes::from_static(b"hello"), "a.zip", "job-123")
            .await
            .unwrap();

        let issued = now_secs();
        assert!(storage.fetch(&url, issued + 29 * 60).is_some());
        assert!(storage.fetch(&url, issued + 31 * 60).is_none());

        let tampered = url.replace("job-123", "job-999");
        assert!(storage.fetch(&tampered, issued).is_none());
    }

    #[tokio::test]
    async fn test_buffer_and_stream_puts_store_identical_content() {
        let storage = MemoryStorage::new("out", "reports");
        let payload = Bytes::from_static(b"converted document");

        let from_buffer = storage
            .put(payload.clone(), "doc.zip", "job-1")
            .await
            .unwrap();
        let first = storage.fetch(&from_buffer, now_secs()).unwrap();

        let reader: ByteReader = Box::new(Cursor::new(payload.clone()));
        let from_stream = storage
            .put_stream(reader, payload.len() as u64, "doc.zip", "job-1")
            .await
            .unwrap();
        let second = storage.fetch(&from_stream, now_secs()).unwrap();

        assert_eq!(first, payload);
        assert_eq!(second, payload);
        assert!(storage
            .objects
            .lock()
            .unwrap()
            .contains_key("reports/job-1/doc.zip"));
    }

    #[tokio::test]
    async fn test_from_properties_requires_provider() {
        let result = from_properties(&Properties::new()).await;
        match result {
            Err(StorageError::Configuration(message)) => {
                assert!(message.contains("storageprovider must have a value"))
            }
            _ => panic!("expected configuration error"),
        }
    }

    #[tokio::test]
    async fn test_from_properties_builds_selected_vendor() {
        let props: Properties = [
            ("storageprovider", "aws"),
            ("storageprovider.aws.region", "eu-west-1"),
            ("storageprovider.aws.accesskey", "AK"),
            ("storageprovider.aws.secretkey", "SK"),
            ("storageprovider.aws.bucketname", "out"),
        ]
        .into_iter()
        .collect();

        let provider = from_properties(&props).await.unwrap();
        assert_eq!(provider.name(), "aws");

        let mut props = props;
        props.set("storageprovider", "do");
        props.set("storageprovider.do.region", "nyc3");
        props.set("storageprovider.do.accesskey", "AK");
        props.set("storageprovider.do.secretkey", "SK");
        props.set("storageprovider.do.bucketname", "out");
        let provider = from_properties(&props).await.unwrap();
        assert_eq!(provider.name(), "do");
    }
}
