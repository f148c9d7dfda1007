//! Stateless anti-forgery tokens.
//!
//! A token is HMAC-SHA256 signed JSON carrying a random nonce, issue
//! timestamp, environment tag, and optionally hashes of the client's
//! user-agent and IP. Wire format is `base64url(payload ":" signature)`.
//! The server keeps no per-token state; verification recomputes the
//! signature and the client binding from the incoming request.

use std::{fmt, sync::Arc, time::Duration};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hmac::{Hmac, Mac};
use postroom_core::{Clock, Environment};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Canonical placeholder for loopback and private addresses.
///
/// Local development sees `::1`, `127.0.0.1`, and literal `localhost`
/// interchangeably depending on how the browser resolved the host, so
/// all of them collapse to one value before hashing.
const LOCAL_CLIENT: &str = "local";

/// Client-identifying materials extracted from the incoming request.
///
/// Raw values are hashed before they enter a token; the raw IP is never
/// stored anywhere.
#[derive(Debug, Clone, Default)]
pub struct ClientContext {
    /// User-Agent header, if present.
    pub user_agent: Option<String>,
    /// Remote address as reported by the connection or proxy headers.
    pub ip: Option<String>,
}

impl ClientContext {
    /// Context with both fingerprint materials present.
    pub fn new(user_agent: impl Into<String>, ip: impl Into<String>) -> Self {
        Self { user_agent: Some(user_agent.into()), ip: Some(ip.into()) }
    }
}

/// How strict token verification is for a given environment.
#[derive(Debug, Clone, Copy)]
pub struct StrictnessProfile {
    /// Maximum accepted token age.
    pub max_age: Duration,
    /// Whether the token must carry and match client fingerprint hashes.
    pub bind_client: bool,
}

impl StrictnessProfile {
    /// Profile for the given environment.
    ///
    /// Production binds tokens to the client and expires them quickly.
    /// Development skips binding and allows day-long tokens so local
    /// iteration does not keep tripping 403s.
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => {
                Self { max_age: Duration::from_secs(60 * 60), bind_client: true }
            }
            Environment::Development => {
                Self { max_age: Duration::from_secs(24 * 60 * 60), bind_client: false }
            }
        }
    }
}

/// Signed token payload.
///
/// Opaque to clients; every field is untrusted until the signature over
/// the serialized form has been verified.
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    /// Random per-token nonce.
    nonce: String,
    /// Issue time, milliseconds since the Unix epoch.
    issued_at_ms: i64,
    /// Environment the token was minted in.
    environment: Environment,
    /// Salted hash of the client's user-agent, when binding is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    ua_hash: Option<String>,
    /// Salted hash of the client's normalized IP, when binding is on.
    #[serde(skip_serializing_if = "Option::is_none")]
    ip_hash: Option<String>,
}

/// Issues and verifies anti-forgery tokens.
///
/// Pure compute, no I/O: both operations only touch the injected clock.
#[derive(Clone)]
pub struct TokenCodec {
    signing_secret: String,
    ip_hash_salt: String,
    environment: Environment,
    profile: StrictnessProfile,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCodec")
            .field("environment", &self.environment)
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// Creates a codec with the default strictness profile for
    /// `environment`.
    pub fn new(
        signing_secret: impl Into<String>,
        ip_hash_salt: impl Into<String>,
        environment: Environment,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            signing_secret: signing_secret.into(),
            ip_hash_salt: ip_hash_salt.into(),
            environment,
            profile: StrictnessProfile::for_environment(environment),
            clock,
        }
    }

    /// Overrides the strictness profile. Mostly useful in tests.
    pub fn with_profile(mut self, profile: StrictnessProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Issues a fresh token for the given client.
    ///
    /// Fingerprint hashes are embedded only when the profile requires
    /// binding; development tokens carry no client material at all.
    pub fn issue(&self, client: &ClientContext) -> String {
        let mut nonce_bytes = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let (ua_hash, ip_hash) = if self.profile.bind_client {
            (
                client.user_agent.as_deref().map(|ua| self.fingerprint_hash(ua)),
                client.ip.as_deref().map(|ip| self.fingerprint_hash(&normalize_client_ip(ip))),
            )
        } else {
            (None, None)
        };

        let payload = TokenPayload {
            nonce: hex::encode(nonce_bytes),
            issued_at_ms: self.clock.now_utc().timestamp_millis(),
            environment: self.environment,
            ua_hash,
            ip_hash,
        };

        // TokenPayload serialization is infallible: no maps, no
        // non-string keys.
        let payload_json =
            serde_json::to_string(&payload).unwrap_or_else(|_| String::from("{}"));
        let signature = self.sign(payload_json.as_bytes());

        URL_SAFE_NO_PAD.encode(format!("{payload_json}:{signature}"))
    }

    /// Verifies a token against the current request.
    ///
    /// Total function: malformed input, bad signatures, expiry, an
    /// environment mismatch, and fingerprint mismatches all return
    /// `false`. Nothing here panics or errors.
    pub fn verify(&self, token: &str, client: &ClientContext) -> bool {
        // Fail closed rather than accept tokens signed with an empty key.
        if self.signing_secret.is_empty() {
            tracing::debug!("token rejected: no signing secret configured");
            return false;
        }

        let Ok(decoded) = URL_SAFE_NO_PAD.decode(token) else {
            tracing::debug!("token rejected: not base64url");
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            tracing::debug!("token rejected: not utf-8");
            return false;
        };

        // The payload is JSON and may itself contain ':', so split on
        // the last separator; the signature is hex and never does.
        let Some((payload_json, signature)) = decoded.rsplit_once(':') else {
            tracing::debug!("token rejected: missing signature separator");
            return false;
        };

        let expected = self.sign(payload_json.as_bytes());
        if !timing_safe_eq(signature, &expected) {
            tracing::debug!("token rejected: signature mismatch");
            return false;
        }

        // Signature holds, so the payload can be trusted from here on.
        let Ok(payload) = serde_json::from_str::<TokenPayload>(payload_json) else {
            tracing::debug!("token rejected: unparseable payload");
            return false;
        };

        if payload.environment != self.environment {
            tracing::debug!(
                token_env = %payload.environment,
                runtime_env = %self.environment,
                "token rejected: environment mismatch"
            );
            return false;
        }

        let now_ms = self.clock.now_utc().timestamp_millis();
        let max_age_ms = i64::try_from(self.profile.max_age.as_millis()).unwrap_or(i64::MAX);
        let age_ms = now_ms.saturating_sub(payload.issued_at_ms);
        if age_ms > max_age_ms || payload.issued_at_ms > now_ms {
            tracing::debug!(age_ms, max_age_ms, "token rejected: expired");
            return false;
        }

        if self.profile.bind_client {
            if !self.binding_matches(payload.ua_hash.as_deref(), client.user_agent.as_deref(), false)
            {
                tracing::debug!("token rejected: user-agent binding mismatch");
                return false;
            }
            if !self.binding_matches(payload.ip_hash.as_deref(), client.ip.as_deref(), true) {
                tracing::debug!("token rejected: ip binding mismatch");
                return false;
            }
        }

        true
    }

    /// Compares a bound fingerprint hash against the current request's
    /// value. A token bound to a value requires that value to be present
    /// and to hash identically; a token without the binding accepts any.
    fn binding_matches(&self, bound: Option<&str>, current: Option<&str>, is_ip: bool) -> bool {
        match bound {
            None => true,
            Some(bound_hash) => {
                let Some(current) = current else { return false };
                let current_hash = if is_ip {
                    self.fingerprint_hash(&normalize_client_ip(current))
                } else {
                    self.fingerprint_hash(current)
                };
                timing_safe_eq(bound_hash, &current_hash)
            }
        }
    }

    fn sign(&self, payload: &[u8]) -> String {
        // HMAC-SHA256 accepts keys of any length, so this cannot fail
        // for a runtime-supplied secret.
        let mut mac = HmacSha256::new_from_slice(self.signing_secret.as_bytes())
            .unwrap_or_else(|_| HmacSha256::new_from_slice(&[0u8; 32]).expect("fixed-size key"));
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    fn fingerprint_hash(&self, value: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.ip_hash_salt.as_bytes());
        hasher.update(value.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Collapses loopback and private addresses to [`LOCAL_CLIENT`].
///
/// Public addresses pass through lowercased. Unparseable input is left
/// as-is rather than rejected; it still hashes deterministically.
pub fn normalize_client_ip(ip: &str) -> String {
    let trimmed = ip.trim().to_ascii_lowercase();
    if trimmed.is_empty() || trimmed == "localhost" {
        return LOCAL_CLIENT.to_string();
    }

    match trimmed.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V4(v4)) => {
            if v4.is_loopback() || v4.is_private() || v4.is_link_local() {
                LOCAL_CLIENT.to_string()
            } else {
                trimmed
            }
        }
        Ok(std::net::IpAddr::V6(v6)) => {
            if v6.is_loopback() {
                return LOCAL_CLIENT.to_string();
            }
            // IPv4-mapped addresses take the IPv4 classification.
            if let Some(v4) = v6.to_ipv4_mapped() {
                if v4.is_loopback() || v4.is_private() || v4.is_link_local() {
                    return LOCAL_CLIENT.to_string();
                }
                return trimmed;
            }
            // Unique-local (fc00::/7) and link-local (fe80::/10).
            let segments = v6.segments();
            if (segments[0] & 0xfe00) == 0xfc00 || (segments[0] & 0xffc0) == 0xfe80 {
                LOCAL_CLIENT.to_string()
            } else {
                trimmed
            }
        }
        Err(_) => trimmed,
    }
}

/// Constant-time string comparison.
///
/// Keeps signature and fingerprint checks from leaking match length
/// through timing.
fn timing_safe_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (a_byte, b_byte) in a.as_bytes().iter().zip(b.as_bytes()) {
        result |= a_byte ^ b_byte;
    }
    result == 0
}
