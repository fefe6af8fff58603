//! RTSP Digest authentication (RFC 2326 §4.11, RFC 2069).
//!
//! When a server is configured with an [`AuthDb`], DESCRIBE and SETUP
//! require a matching `Authorization: Digest` header; a missing or invalid
//! header gets a fresh `401` challenge with a new per-connection nonce.
//!
//! Scope: this implements the `MD5` digest scheme without `qop`/`cnonce`
//! (RFC 2069's simpler predecessor to RFC 2617), matching what the spec
//! calls for — "servers issue Digest challenges with a per-realm nonce" —
//! without the session-integrity extensions RTSP clients rarely send.

use std::collections::HashMap;

use rand::Rng;

/// Credential store for one authentication realm.
///
/// Passwords are never stored in the clear: [`add_user`](Self::add_user)
/// immediately folds `username:realm:password` through MD5 into `HA1`
/// (RFC 2069 §2.1.1), which is all [`validate`](Self::validate) ever needs.
#[derive(Debug, Clone)]
pub struct AuthDb {
    pub realm: String,
    // username -> HA1 = md5(username:realm:password), hex-encoded
    ha1_by_user: HashMap<String, String>,
}

impl AuthDb {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            ha1_by_user: HashMap::new(),
        }
    }

    /// Register (or update) a user's password.
    pub fn add_user(&mut self, username: &str, password: &str) {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        self.ha1_by_user.insert(username.to_string(), ha1);
    }

    fn ha1(&self, username: &str) -> Option<&str> {
        self.ha1_by_user.get(username).map(|s| s.as_str())
    }

    /// Validate a parsed `Authorization: Digest` header against a known
    /// nonce, RTSP method, and request URI.
    ///
    /// Returns `true` only when: the header names a known user, its realm
    /// and nonce match what was challenged, and its `response` field equals
    /// the digest this server independently computes.
    pub fn validate(&self, header: &DigestAuthorization, method: &str, expected_nonce: &str) -> bool {
        if header.realm != self.realm || header.nonce != expected_nonce {
            return false;
        }
        let Some(ha1) = self.ha1(&header.username) else {
            return false;
        };
        let ha2 = md5_hex(&format!("{}:{}", method, header.uri));
        let expected = md5_hex(&format!("{}:{}:{}", ha1, header.nonce, ha2));
        expected == header.response
    }
}

/// Fields extracted from a client's `Authorization: Digest ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestAuthorization {
    pub username: String,
    pub realm: String,
    pub nonce: String,
    pub uri: String,
    pub response: String,
}

impl DigestAuthorization {
    /// Parse `Authorization: Digest username="...", realm="...", nonce="...",
    /// uri="...", response="..."`. Unknown fields (`qop`, `cnonce`, `nc`,
    /// `algorithm`) are accepted but ignored. Returns `None` if any
    /// required field is missing or the scheme isn't `Digest`.
    pub fn parse(header_value: &str) -> Option<Self> {
        let rest = header_value.trim().strip_prefix("Digest")?.trim();

        let mut fields: HashMap<String, String> = HashMap::new();
        for part in split_comma_respecting_quotes(rest) {
            let part = part.trim();
            let eq = part.find('=')?;
            let key = part[..eq].trim().to_ascii_lowercase();
            let value = part[eq + 1..].trim().trim_matches('"').to_string();
            fields.insert(key, value);
        }

        Some(Self {
            username: fields.remove("username")?,
            realm: fields.remove("realm")?,
            nonce: fields.remove("nonce")?,
            uri: fields.remove("uri")?,
            response: fields.remove("response")?,
        })
    }
}

/// Split on top-level commas, ignoring commas inside `"..."` quoted values.
fn split_comma_respecting_quotes(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Generate a fresh opaque nonce for a `WWW-Authenticate` challenge.
///
/// Not cryptographically bound to time or client — a random 128-bit value
/// hex-encoded, matching the "per-realm nonce" the spec describes rather
/// than RFC 2617's timestamp-plus-hash construction.
pub fn generate_nonce() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Render the `WWW-Authenticate: Digest realm="...", nonce="..."` header
/// value for a `401` challenge.
pub fn challenge_header(realm: &str, nonce: &str) -> String {
    format!("Digest realm=\"{}\", nonce=\"{}\"", realm, nonce)
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_valid_credentials() {
        let mut db = AuthDb::new("streaming");
        db.add_user("alice", "secret");

        let nonce = generate_nonce();
        let ha1 = md5_hex("alice:streaming:secret");
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

        let header = DigestAuthorization {
            username: "alice".to_string(),
            realm: "streaming".to_string(),
            nonce: nonce.clone(),
            uri: "rtsp://host/stream".to_string(),
            response,
        };

        assert!(db.validate(&header, "DESCRIBE", &nonce));
    }

    #[test]
    fn wrong_password_rejected() {
        let mut db = AuthDb::new("streaming");
        db.add_user("alice", "secret");

        let nonce = generate_nonce();
        let ha1 = md5_hex("alice:streaming:WRONG");
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let response = md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2));

        let header = DigestAuthorization {
            username: "alice".to_string(),
            realm: "streaming".to_string(),
            nonce: nonce.clone(),
            uri: "rtsp://host/stream".to_string(),
            response,
        };

        assert!(!db.validate(&header, "DESCRIBE", &nonce));
    }

    #[test]
    fn stale_nonce_rejected() {
        let mut db = AuthDb::new("streaming");
        db.add_user("alice", "secret");

        let old_nonce = generate_nonce();
        let current_nonce = generate_nonce();
        let ha1 = md5_hex("alice:streaming:secret");
        let ha2 = md5_hex("DESCRIBE:rtsp://host/stream");
        let response = md5_hex(&format!("{}:{}:{}", ha1, old_nonce, ha2));

        let header = DigestAuthorization {
            username: "alice".to_string(),
            realm: "streaming".to_string(),
            nonce: old_nonce,
            uri: "rtsp://host/stream".to_string(),
            response,
        };

        assert!(!db.validate(&header, "DESCRIBE", &current_nonce));
    }

    #[test]
    fn unknown_user_rejected() {
        let db = AuthDb::new("streaming");
        let nonce = generate_nonce();
        let header = DigestAuthorization {
            username: "ghost".to_string(),
            realm: "streaming".to_string(),
            nonce: nonce.clone(),
            uri: "rtsp://host/stream".to_string(),
            response: "deadbeef".to_string(),
        };
        assert!(!db.validate(&header, "DESCRIBE", &nonce));
    }

    #[test]
    fn parse_digest_header() {
        let raw = r#"Digest username="alice", realm="streaming", nonce="abc123", uri="rtsp://host/stream", response="deadbeefcafebabe0123456789abcdef""#;
        let parsed = DigestAuthorization::parse(raw).unwrap();
        assert_eq!(parsed.username, "alice");
        assert_eq!(parsed.realm, "streaming");
        assert_eq!(parsed.nonce, "abc123");
        assert_eq!(parsed.uri, "rtsp://host/stream");
        assert_eq!(parsed.response, "deadbeefcafebabe0123456789abcdef");
    }

    #[test]
    fn parse_rejects_non_digest_scheme() {
        assert!(DigestAuthorization::parse("Basic dXNlcjpwYXNz").is_none());
    }

    #[test]
    fn parse_rejects_missing_field() {
        let raw = r#"Digest username="alice", realm="streaming", nonce="abc123", uri="rtsp://host/stream""#;
        assert!(DigestAuthorization::parse(raw).is_none());
    }

    #[test]
    fn nonces_are_unique() {
        assert_ne!(generate_nonce(), generate_nonce());
    }
}
