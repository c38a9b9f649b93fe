//! Authentication strategies for collector exporters
//!
//! The `authentication` namespace of a sink config selects one variant through
//! its `type` discriminator. Each variant knows which of its fields are secret
//! and what collector extension it renders to.

use serde_json::{json, Value};

use super::cipher::{CipherError, CredentialCipher};
use super::{required_str, ConfigError, ConfigMap};

pub const BASIC_AUTH: &str = "basicauth";
pub const BEARER_TOKEN: &str = "bearertoken";
pub const NO_AUTH: &str = "noauth";

/// Extension name referenced by exporters using basic auth
pub const BASIC_AUTH_EXTENSION: &str = "basicauth/exporter";

/// Extension name referenced by exporters using a bearer token
pub const BEARER_TOKEN_EXTENSION: &str = "bearertokenauth/withscheme";

const DEFAULT_BEARER_SCHEME: &str = "Bearer";

/// Resolved authentication strategy
#[derive(Clone, PartialEq, Eq)]
pub enum AuthStrategy {
    BasicAuth { username: String, password: String },
    BearerToken { scheme: String, token: String },
    NoAuth,
}

impl AuthStrategy {
    /// Resolve a strategy from a decrypted `authentication` block
    pub fn from_config(auth: &ConfigMap) -> Result<Self, ConfigError> {
        let auth_type = required_str(auth, "authentication.type", "type")?;

        match auth_type {
            BASIC_AUTH => Ok(Self::BasicAuth {
                username: required_str(auth, "authentication.username", "username")?.to_string(),
                password: required_str(auth, "authentication.password", "password")?.to_string(),
            }),
            BEARER_TOKEN => Ok(Self::BearerToken {
                scheme: auth
                    .get("scheme")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .unwrap_or(DEFAULT_BEARER_SCHEME)
                    .to_string(),
                token: required_str(auth, "authentication.token", "token")?.to_string(),
            }),
            NO_AUTH => Ok(Self::NoAuth),
            other => Err(ConfigError::UnsupportedAuth(other.to_string())),
        }
    }

    pub fn auth_type(&self) -> &'static str {
        match self {
            Self::BasicAuth { .. } => BASIC_AUTH,
            Self::BearerToken { .. } => BEARER_TOKEN,
            Self::NoAuth => NO_AUTH,
        }
    }

    /// Name of the rendered extension, if this strategy renders one
    pub fn extension_name(&self) -> Option<&'static str> {
        match self {
            Self::BasicAuth { .. } => Some(BASIC_AUTH_EXTENSION),
            Self::BearerToken { .. } => Some(BEARER_TOKEN_EXTENSION),
            Self::NoAuth => None,
        }
    }

    /// Collector extension block for this strategy
    pub fn extension(&self) -> Option<(String, Value)> {
        let name = self.extension_name()?.to_string();
        let body = match self {
            Self::BasicAuth { username, password } => json!({
                "client_auth": {
                    "username": username,
                    "password": password,
                }
            }),
            Self::BearerToken { scheme, token } => json!({
                "scheme": scheme,
                "token": token,
            }),
            Self::NoAuth => return None,
        };
        Some((name, body))
    }
}

impl std::fmt::Debug for AuthStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BasicAuth { username, .. } => f
                .debug_struct("BasicAuth")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::BearerToken { scheme, .. } => f
                .debug_struct("BearerToken")
                .field("scheme", scheme)
                .field("token", &"<redacted>")
                .finish(),
            Self::NoAuth => write!(f, "NoAuth"),
        }
    }
}

/// Secret fields stored encrypted for a given auth type
///
/// Unknown types have no secret fields; they are rejected later when the
/// manifest is built.
pub fn secret_fields(auth_type: &str) -> &'static [&'static str] {
    match auth_type {
        BASIC_AUTH => &["password"],
        BEARER_TOKEN => &["token"],
        _ => &[],
    }
}

fn auth_block_mut(config: &mut ConfigMap) -> Option<&mut ConfigMap> {
    config.get_mut("authentication").and_then(Value::as_object_mut)
}

fn transform_secrets<F>(config: &mut ConfigMap, mut transform: F) -> Result<(), CipherError>
where
    F: FnMut(&str) -> Result<String, CipherError>,
{
    let Some(auth) = auth_block_mut(config) else {
        return Ok(());
    };
    let auth_type = auth
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    for field in secret_fields(&auth_type) {
        if let Some(Value::String(value)) = auth.get_mut(*field) {
            if value.is_empty() {
                continue;
            }
            *value = transform(value)?;
        }
    }
    Ok(())
}

/// Replace plaintext secret fields with their ciphertext
pub fn encrypt_secrets(config: &mut ConfigMap, cipher: &CredentialCipher) -> Result<(), CipherError> {
    transform_secrets(config, |plain| cipher.encode(plain))
}

/// Replace encrypted secret fields with their plaintext
pub fn decrypt_secrets(config: &mut ConfigMap, cipher: &CredentialCipher) -> Result<(), CipherError> {
    transform_secrets(config, |sealed| cipher.decode(sealed))
}
