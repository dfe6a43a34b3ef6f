//! Authentication secrets for the two listener domains
//!
//! The public domain is keyed by a long-lived secret supplied at startup.
//! The CTL domain is keyed by a [`CtlSecret`] generated once per process and
//! never persisted. The two types are distinct so a verifier for one domain
//! cannot be constructed from the other's secret.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// Number of random bytes in a CTL secret (256 bits)
pub const CTL_SECRET_BYTES: usize = 32;

/// Something a bearer token can be checked against
pub trait BearerSecret: Send + Sync + 'static {
    /// Token bytes as they appear after `Bearer `
    fn expose(&self) -> &[u8];

    /// Constant-time comparison against a presented token
    fn verify(&self, presented: &[u8]) -> bool {
        constant_time_eq(self.expose(), presented)
    }
}

/// Per-process secret for the loopback CTL listener
pub struct CtlSecret {
    token: Zeroizing<String>,
}

impl CtlSecret {
    /// Draw 256 bits from the OS RNG
    pub fn generate() -> Self {
        let mut raw = Zeroizing::new([0u8; CTL_SECRET_BYTES]);
        OsRng.fill_bytes(raw.as_mut());
        Self {
            token: Zeroizing::new(URL_SAFE_NO_PAD.encode(raw.as_ref())),
        }
    }

    /// Encoded token, for injection into child environments only
    pub fn as_str(&self) -> &str {
        &self.token
    }

    /// Short SHA-256 fingerprint safe to log
    pub fn fingerprint(&self) -> String {
        fingerprint(self.token.as_bytes())
    }
}

impl BearerSecret for CtlSecret {
    fn expose(&self) -> &[u8] {
        self.token.as_bytes()
    }
}

impl fmt::Debug for CtlSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CtlSecret({})", self.fingerprint())
    }
}

/// Long-lived shared secret for the control-plane listener
pub struct PublicSecret {
    token: Zeroizing<String>,
}

impl PublicSecret {
    /// A missing or empty secret is a configuration error
    pub fn new(token: impl Into<String>) -> Result<Self> {
        let token = Zeroizing::new(token.into());
        if token.trim().is_empty() {
            return Err(Error::Config("public secret must not be empty".to_string()));
        }
        Ok(Self { token })
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(self.token.as_bytes())
    }
}

impl BearerSecret for PublicSecret {
    fn expose(&self) -> &[u8] {
        self.token.as_bytes()
    }
}

impl fmt::Debug for PublicSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicSecret({})", self.fingerprint())
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest[..4].iter().map(|b| format!("{:02x}", b)).collect()
}

/// Both sides are hashed first so neither the contents nor the length leak
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let a = Sha256::digest(a);
    let b = Sha256::digest(b);
    bool::from(a.as_slice().ct_eq(b.as_slice()))
}
