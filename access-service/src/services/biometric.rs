//! Biometric verifier boundary.
//!
//! Approvers prove presence with a short-lived token minted by their enrolled
//! device. Verification is fail-closed at the call site: a `false` result and
//! any [`BiometricError`] both reject the approval attempt.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::atomic::{AtomicU64, Ordering};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock drift between device and server.
const MAX_CLOCK_SKEW_SECS: i64 = 30;

#[derive(Debug, Error)]
pub enum BiometricError {
    #[error("Malformed biometric token: {0}")]
    Malformed(String),

    #[error("Biometric token expired")]
    Expired,

    #[error("Biometric verifier unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BiometricVerifier: Send + Sync {
    async fn verify(
        &self,
        request_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<bool, BiometricError>;
}

/// Verifies `<issued_at>.<hex(HMAC-SHA256(secret, "<request>:<user>:<issued_at>"))>`.
pub struct HmacBiometricVerifier {
    secret: Vec<u8>,
    max_age: Duration,
}

impl HmacBiometricVerifier {
    pub fn new(secret: impl Into<Vec<u8>>, max_age: Duration) -> Self {
        Self {
            secret: secret.into(),
            max_age,
        }
    }

    fn signature(&self, request_id: Uuid, user_id: Uuid, issued_at: i64) -> Vec<u8> {
        // HMAC accepts keys of any length.
        let mut mac = match HmacSha256::new_from_slice(&self.secret) {
            Ok(mac) => mac,
            Err(_) => return Vec::new(),
        };
        mac.update(format!("{}:{}:{}", request_id, user_id, issued_at).as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    /// Mint a token the way an enrolled device would.
    pub fn issue(&self, request_id: Uuid, user_id: Uuid, issued_at: DateTime<Utc>) -> String {
        let ts = issued_at.timestamp();
        format!("{}.{}", ts, hex::encode(self.signature(request_id, user_id, ts)))
    }

    fn check_at(
        &self,
        request_id: Uuid,
        user_id: Uuid,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, BiometricError> {
        let (ts, sig_hex) = token
            .split_once('.')
            .ok_or_else(|| BiometricError::Malformed("missing separator".to_string()))?;
        let issued_at: i64 = ts
            .parse()
            .map_err(|_| BiometricError::Malformed("bad timestamp".to_string()))?;
        let provided =
            hex::decode(sig_hex).map_err(|e| BiometricError::Malformed(e.to_string()))?;

        let age = now
            .timestamp()
            .checked_sub(issued_at)
            .ok_or_else(|| BiometricError::Malformed("timestamp out of range".to_string()))?;
        if age < -MAX_CLOCK_SKEW_SECS || age > self.max_age.num_seconds() {
            return Err(BiometricError::Expired);
        }

        let expected = self.signature(request_id, user_id, issued_at);
        if expected.is_empty() {
            return Ok(false);
        }
        Ok(expected.ct_eq(&provided).into())
    }
}

#[async_trait]
impl BiometricVerifier for HmacBiometricVerifier {
    async fn verify(
        &self,
        request_id: Uuid,
        user_id: Uuid,
        token: &str,
    ) -> Result<bool, BiometricError> {
        self.check_at(request_id, user_id, token, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockVerdict {
    Accept,
    Reject,
    Fail,
}

/// Mock verifier for testing.
pub struct MockBiometricVerifier {
    verdict: MockVerdict,
    verify_count: AtomicU64,
}

impl MockBiometricVerifier {
    pub fn new(verdict: MockVerdict) -> Self {
        Self {
            verdict,
            verify_count: AtomicU64::new(0),
        }
    }

    pub fn accepting() -> Self {
        Self::new(MockVerdict::Accept)
    }

    pub fn verify_count(&self) -> u64 {
        self.verify_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricVerifier for MockBiometricVerifier {
    async fn verify(
        &self,
        request_id: Uuid,
        user_id: Uuid,
        _token: &str,
    ) -> Result<bool, BiometricError> {
        self.verify_count.fetch_add(1, Ordering::SeqCst);
        tracing::info!(%request_id, %user_id, verdict = ?self.verdict, "[MOCK] Biometric verification");
        match self.verdict {
            MockVerdict::Accept => Ok(true),
            MockVerdict::Reject => Ok(false),
            MockVerdict::Fail => Err(BiometricError::Unavailable("mock failure".to_string())),
        }
    }
}
