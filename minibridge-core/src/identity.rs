//! Agent identity: who is calling, and a fingerprint binding sessions to it.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::auth::{Auth, parse_authorization};

/// Header carrying the agent's address as seen by the frontend.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";

/// Header carrying the agent's user agent as seen by the frontend.
pub const FORWARDED_UA_HEADER: &str = "X-Forwarded-UA";

/// Caller information passed to policers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    /// Credential presented by the agent (the bearer token or basic password).
    pub token: String,

    #[serde(rename = "remoteAddr")]
    pub remote_addr: String,

    #[serde(rename = "userAgent", default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
}

impl Agent {
    /// Builds an agent from the `Authorization`, `X-Forwarded-For` and
    /// `X-Forwarded-UA` header values. Missing or unparsable values are empty.
    pub fn from_headers(
        authorization: Option<&str>,
        forwarded_for: Option<&str>,
        forwarded_ua: Option<&str>,
    ) -> Self {
        let token = authorization
            .and_then(|h| parse_authorization(h).ok())
            .map(|auth| auth.password().to_string())
            .unwrap_or_default();

        Self {
            token,
            remote_addr: forwarded_for.unwrap_or_default().to_string(),
            user_agent: forwarded_ua.unwrap_or_default().to_string(),
        }
    }
}

/// Stable hash of the identity material presented when a session is created.
///
/// Requests reusing a session id must present material hashing to the same
/// value, so a session id alone never grants access to another principal's
/// backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityFingerprint(u64);

impl IdentityFingerprint {
    /// Fingerprint of optional credentials plus every forwarded
    /// `Authorization` header value, in order.
    pub fn compute(auth: Option<&Auth>, authorization_headers: &[String]) -> Self {
        let headers = format!("[{}]", authorization_headers.join(" "));
        let material = match auth {
            Some(auth) => format!("{}-{headers}", auth.encode()),
            None => headers,
        };

        let digest = Sha256::digest(material.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(prefix) & 0x7FFF_FFFF_FFFF_FFFF)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for IdentityFingerprint {
    fn from(value: u64) -> Self {
        Self(value)
    }
}
