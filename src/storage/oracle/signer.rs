//! OCI request signing (draft-cavage HTTP signatures, `rsa-sha256`).

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, DATE, HOST};
use reqwest::Request;
use sha2::{Digest, Sha256};
use std::fs;

use super::profile::OciProfile;
use crate::error::{Result, StorageError};

const CONTENT_SHA256: &str = "x-content-sha256";

pub struct RequestSigner {
    key_id: String,
    key: EncodingKey,
}

impl RequestSigner {
    pub fn from_pem(key_id: String, pem: &[u8]) -> Result<Self> {
        let key = EncodingKey::from_rsa_pem(pem).map_err(|e| {
            StorageError::Configuration(format!("Invalid OCI API signing key: {}", e))
        })?;
        Ok(Self { key_id, key })
    }

    pub fn from_profile(profile: &OciProfile) -> Result<Self> {
        let pem = fs::read(&profile.key_file).map_err(|e| {
            StorageError::Configuration(format!(
                "Failed to read OCI key_file {}: {}",
                profile.key_file.display(),
                e
            ))
        })?;
        Self::from_pem(profile.key_id(), &pem)
    }

    /// Adds `date` and `authorization` headers to `request`.
    ///
    /// With `sign_body`, the in-memory body is also bound through `x-content-sha256`,
    /// `content-length` and `content-type`. Object PUT bodies are exempt.
    pub fn sign(&self, request: &mut Request, sign_body: bool, now: DateTime<Utc>) -> Result<()> {
        let url = request.url();
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(StorageError::Configuration(format!(
                    "Request URL has no host: {}",
                    url
                )))
            }
        };
        let method = request.method().as_str().to_lowercase();
        let target = match url.query() {
            Some(query) => format!("{} {}?{}", method, url.path(), query),
            None => format!("{} {}", method, url.path()),
        };
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();

        let mut signed = vec![
            ("date", date),
            ("(request-target)", target),
            ("host", host),
        ];

        if sign_body {
            let body = request
                .body()
                .and_then(|b| b.as_bytes())
                .unwrap_or_default();
            let content_type = request
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("application/json")
                .to_string();
            let digest = STANDARD.encode(Sha256::digest(body));

            signed.push(("content-length", body.len().to_string()));
            signed.push(("content-type", content_type));
            signed.push((CONTENT_SHA256, digest));
        }

        let signature = self.signature(&signing_string(&signed))?;
        let header_names: Vec<&str> = signed.iter().map(|(name, _)| *name).collect();
        let authorization = format!(
            "Signature version=\"1\",keyId=\"{}\",algorithm=\"rsa-sha256\",headers=\"{}\",signature=\"{}\"",
            self.key_id,
            header_names.join(" "),
            signature
        );

        let headers = request.headers_mut();
        for (name, value) in &signed {
            let value = header_value(value)?;
            match *name {
                "date" => headers.insert(DATE, value),
                "host" => headers.insert(HOST, value),
                "content-length" => headers.insert(CONTENT_LENGTH, value),
                "content-type" => headers.insert(CONTENT_TYPE, value),
                CONTENT_SHA256 => headers.insert(CONTENT_SHA256, value),
                _ => None,
            };
        }
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        Ok(())
    }

    /// RSASSA-PKCS1-v1_5 over SHA-256, standard base64.
    fn signature(&self, signing_string: &str) -> Result<String> {
        let url_safe =
            jsonwebtoken::crypto::sign(signing_string.as_bytes(), &self.key, Algorithm::RS256)
                .map_err(|e| StorageError::Configuration(format!("Failed to sign request: {}", e)))?;
        let raw = URL_SAFE_NO_PAD
            .decode(url_safe)
            .map_err(|e| StorageError::Configuration(format!("Failed to sign request: {}", e)))?;
        Ok(STANDARD.encode(raw))
    }
}

pub fn signing_string(headers: &[(&str, String)]) -> String {
    headers
        .iter()
        .map(|(name, value)| format!("{}: {}", name, value))
        .collect::<Vec<_>>()
        .join("\n")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| StorageError::Configuration(format!("Invalid header value: {}", e)))
}
