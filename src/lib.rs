//! Pluggable object storage for finished conversion artifacts.
//!
//! Each backend uploads a file under `{basepath}/{job_id}/{file_name}` and returns a
//! download URL that stays valid for [`SIGNED_URL_TTL`]. Backends are selected and
//! configured from a [`Properties`] bag using the `storageprovider.{vendor}.*` keys.

pub mod config;
pub mod error;
pub mod storage;

pub use config::Properties;
pub use error::{Result, StorageError};
pub use storage::{
    connect, from_properties, object_key, ByteReader, StorageProvider, Vendor, SIGNED_URL_TTL,
};
