//! Credential digests for the authentication handshake.
//!
//! The password never crosses the wire in clear; the client sends the hex
//! blake3 digest and the server compares digests in constant time.

use super::message::{AuthenticationRequest, AuthenticationResponse, PROTOCOL_VERSION};

/// Hex blake3 digest of a password.
pub fn password_digest(password: &str) -> String {
    hex::encode(blake3::hash(password.as_bytes()).as_bytes())
}

/// Build the request a client sends first.
pub fn authentication_request(username: &str, password: &str) -> AuthenticationRequest {
    AuthenticationRequest {
        version: PROTOCOL_VERSION,
        username: username.to_string(),
        digest: password_digest(password),
    }
}

/// Server-side credential check.
#[derive(Debug, Clone)]
pub struct Authenticator {
    username: String,
    digest: blake3::Hash,
}

impl Authenticator {
    pub fn new(username: impl Into<String>, password: &str) -> Self {
        Self {
            username: username.into(),
            digest: blake3::hash(password.as_bytes()),
        }
    }

    /// Check a request and build the matching response.
    pub fn verify(&self, request: &AuthenticationRequest) -> AuthenticationResponse {
        if request.version != PROTOCOL_VERSION {
            return reject(format!(
                "Unsupported protocol version {} (server speaks {})",
                request.version, PROTOCOL_VERSION
            ));
        }

        // blake3::Hash equality is constant-time
        let digest_ok = blake3::Hash::from_hex(request.digest.as_bytes())
            .map(|digest| digest == self.digest)
            .unwrap_or(false);

        if request.username != self.username || !digest_ok {
            return reject("Invalid username or password".to_string());
        }

        AuthenticationResponse {
            accepted: true,
            reason: String::new(),
        }
    }
}

fn reject(reason: String) -> AuthenticationResponse {
    AuthenticationResponse {
        accepted: false,
        reason,
    }
}
