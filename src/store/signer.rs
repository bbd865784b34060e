use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const ALGORITHM: &str = "AWS4-HMAC-SHA256";
pub const CONTENT_TYPE: &str = "application/x-amz-json-1.0";
pub const BATCH_WRITE_TARGET: &str = "DynamoDB_20120810.BatchWriteItem";
const SIGNED_HEADERS: &str = "content-type;host;x-amz-date;x-amz-target";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("invalid HMAC key: {0}")]
    InvalidKey(#[from] hmac::digest::InvalidLength),
}

/// Everything that goes into one request signature.
#[derive(Debug, Clone)]
pub struct SigningParams<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub target: &'a str,
    pub access_key: &'a str,
    pub secret_key: &'a str,
    pub now: DateTime<Utc>,
}

/// Headers to attach to the signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub amz_date: String,
    pub amz_target: String,
    pub authorization: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            ("Content-Type", CONTENT_TYPE),
            ("X-Amz-Date", &self.amz_date),
            ("X-Amz-Target", &self.amz_target),
            ("Authorization", &self.authorization),
        ]
    }
}

/// Signature Version 4 over a JSON `payload`. The payload must be byte-for-byte
/// the body that is sent.
pub fn sign(params: &SigningParams, payload: &str) -> Result<SignedHeaders, SignError> {
    let amz_date = params.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = &amz_date[..8];

    let canonical_headers = format!(
        "content-type:{}\nhost:{}\nx-amz-date:{}\nx-amz-target:{}\n",
        CONTENT_TYPE, params.host, amz_date, params.target
    );
    let canonical_request = format!(
        "{}\n/\n\n{}\n{}\n{}",
        params.method,
        canonical_headers,
        SIGNED_HEADERS,
        sha256_hex(payload.as_bytes())
    );

    let scope = format!("{}/{}/{}/aws4_request", date_stamp, params.region, params.service);
    let string_to_sign = format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        sha256_hex(canonical_request.as_bytes())
    );

    let key = signing_key(params.secret_key, date_stamp, params.region, params.service)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(SignedHeaders {
        amz_date,
        amz_target: params.target.to_string(),
        authorization: format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            ALGORITHM, params.access_key, scope, SIGNED_HEADERS, signature
        ),
    })
}

fn signing_key(secret: &str, date_stamp: &str, region: &str, service: &str) -> Result<Vec<u8>, SignError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date_stamp.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SignError> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
