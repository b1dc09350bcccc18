//! Push subscription signature verification.
//!
//! The service signs every push delivery with a `Sailhouse-Signature`
//! header of the form `t=<unix-seconds>,v1=<hex hmac-sha256>`, where the
//! HMAC covers `"{t}.{raw body}"`. Verify against the body exactly as it
//! was received, before parsing it as JSON.

use std::fmt;

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::client::Sailhouse;
use crate::types::Metadata;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the push signature.
pub const PUSH_SIGNATURE_HEADER: &str = "Sailhouse-Signature";

/// Default maximum age of a signed request, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Why a push signature was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VerificationErrorCode {
    MissingSecret,
    MissingSignatureHeader,
    InvalidSignatureFormat,
    InvalidTimestamp,
    TimestampTooOld,
    InvalidSignature,
}

impl VerificationErrorCode {
    /// Stable string form of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingSecret => "MISSING_SECRET",
            Self::MissingSignatureHeader => "MISSING_SIGNATURE_HEADER",
            Self::InvalidSignatureFormat => "INVALID_SIGNATURE_FORMAT",
            Self::InvalidTimestamp => "INVALID_TIMESTAMP",
            Self::TimestampTooOld => "TIMESTAMP_TOO_OLD",
            Self::InvalidSignature => "INVALID_SIGNATURE",
        }
    }
}

impl fmt::Display for VerificationErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected push signature.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} ({code})")]
pub struct VerificationError {
    /// Machine-readable failure kind.
    pub code: VerificationErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl VerificationError {
    fn new(code: VerificationErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Options for signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationOptions {
    /// Maximum accepted age of the signature timestamp, in seconds.
    /// Zero accepts only the current second.
    pub tolerance: i64,
}

impl Default for VerificationOptions {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE_SECS,
        }
    }
}

impl VerificationOptions {
    /// Options with the given tolerance in seconds.
    pub fn with_tolerance(tolerance: i64) -> Self {
        Self { tolerance }
    }
}

/// Parsed `t`/`v1` pair from a signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureComponents {
    pub timestamp: i64,
    pub signature: String,
}

/// Body of a push delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSubscriptionPayload {
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    #[serde(default)]
    pub timestamp: String,
}

/// Verifies push subscription signatures against a shared secret.
#[derive(Clone)]
pub struct PushSubscriptionVerifier {
    secret: String,
}

impl fmt::Debug for PushSubscriptionVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushSubscriptionVerifier").finish_non_exhaustive()
    }
}

impl PushSubscriptionVerifier {
    /// Create a verifier. The secret must not be empty.
    pub fn new(secret: impl Into<String>) -> Result<Self, VerificationError> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(VerificationError::new(
                VerificationErrorCode::MissingSecret,
                "push subscription secret is required",
            ));
        }
        Ok(Self { secret })
    }

    /// Verify a signature header against the raw request body.
    ///
    /// `None` options use the default 300 second tolerance.
    pub fn verify_signature(
        &self,
        header: &str,
        body: &str,
        options: Option<VerificationOptions>,
    ) -> Result<(), VerificationError> {
        self.verify_at(header, body, options.unwrap_or_default(), Utc::now().timestamp())
    }

    fn verify_at(
        &self,
        header: &str,
        body: &str,
        options: VerificationOptions,
        now: i64,
    ) -> Result<(), VerificationError> {
        let components = parse_signature_header(header)?;

        if !timestamp_is_fresh(components.timestamp, options.tolerance, now) {
            return Err(VerificationError::new(
                VerificationErrorCode::TimestampTooOld,
                format!(
                    "request timestamp is too old; maximum age is {} seconds",
                    options.tolerance
                ),
            ));
        }

        let expected = self.mac(components.timestamp, body);
        let provided = hex::decode(&components.signature).map_err(|_| invalid_signature())?;

        // verify_slice compares in constant time
        expected.verify_slice(&provided).map_err(|_| invalid_signature())
    }

    /// Compute the `v1` signature for a timestamp and body.
    pub fn compute_signature(&self, timestamp: i64, body: &str) -> String {
        hex::encode(self.mac(timestamp, body).finalize().into_bytes())
    }

    fn mac(&self, timestamp: i64, body: &str) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any length");
        mac.update(format!("{}.{}", timestamp, body).as_bytes());
        mac
    }
}

fn invalid_signature() -> VerificationError {
    VerificationError::new(
        VerificationErrorCode::InvalidSignature,
        "signature verification failed",
    )
}

fn timestamp_is_fresh(timestamp: i64, tolerance: i64, now: i64) -> bool {
    now.saturating_sub(timestamp) <= tolerance && timestamp <= now
}

/// Parse a `t=<timestamp>,v1=<signature>` header.
///
/// Elements may appear in any order and may carry surrounding whitespace.
/// Unknown keys and elements without `=` are ignored.
pub fn parse_signature_header(header: &str) -> Result<SignatureComponents, VerificationError> {
    if header.is_empty() {
        return Err(VerificationError::new(
            VerificationErrorCode::MissingSignatureHeader,
            "signature header is required",
        ));
    }

    let mut timestamp = None;
    let mut signature = None;

    for element in header.split(',') {
        let Some((key, value)) = element.trim().split_once('=') else {
            continue;
        };

        match key {
            "t" => {
                let parsed = value.parse::<i64>().map_err(|_| {
                    VerificationError::new(
                        VerificationErrorCode::InvalidTimestamp,
                        "invalid timestamp in signature header",
                    )
                })?;
                timestamp = Some(parsed);
            }
            "v1" => signature = Some(value.to_string()),
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(timestamp), Some(signature)) => Ok(SignatureComponents {
            timestamp,
            signature,
        }),
        _ => Err(VerificationError::new(
            VerificationErrorCode::InvalidSignatureFormat,
            "invalid signature header format, expected t=<timestamp>,v1=<signature>",
        )),
    }
}

/// Produce a signature header for `body` signed at `timestamp`.
pub fn sign_push_payload(
    secret: &str,
    timestamp: i64,
    body: &str,
) -> Result<String, VerificationError> {
    let verifier = PushSubscriptionVerifier::new(secret)?;
    Ok(format!(
        "t={},v1={}",
        timestamp,
        verifier.compute_signature(timestamp, body)
    ))
}

/// One-off verification without keeping a verifier around.
pub fn verify_push_subscription_signature(
    secret: &str,
    header: &str,
    body: &str,
    options: Option<VerificationOptions>,
) -> Result<(), VerificationError> {
    PushSubscriptionVerifier::new(secret)?.verify_signature(header, body, options)
}

/// Like [`verify_push_subscription_signature`], collapsing any failure to `false`.
pub fn verify_push_subscription_signature_safe(
    secret: &str,
    header: &str,
    body: &str,
    options: Option<VerificationOptions>,
) -> bool {
    verify_push_subscription_signature(secret, header, body, options).is_ok()
}

impl Sailhouse {
    /// Verify a push subscription signature.
    pub fn verify_push_subscription(
        &self,
        header: &str,
        body: &str,
        secret: &str,
        options: Option<VerificationOptions>,
    ) -> Result<(), VerificationError> {
        verify_push_subscription_signature(secret, header, body, options)
    }

    /// Create a reusable verifier for a secret.
    pub fn push_subscription_verifier(
        &self,
        secret: &str,
    ) -> Result<PushSubscriptionVerifier, VerificationError> {
        PushSubscriptionVerifier::new(secret)
    }
}
