use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sdk::errors::ValidationError;
use serde_json::json;

/// Key under which registry auth is stored in a credential object
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

/// A registry password that never shows up in logs
///
/// `Debug` and `Display` always print `[REDACTED]`. Use `expose()` to get
/// at the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Password(String);

impl Password {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

impl fmt::Display for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Username and password parsed from a `user:pass` override
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: Password,
}

impl RegistryAuth {
    /// Split on the first `:`; both halves must be non-empty
    pub fn parse(value: &str) -> Result<Self, ValidationError> {
        let (username, password) = value
            .split_once(':')
            .ok_or(ValidationError::InvalidCredentialOverride)?;

        if username.is_empty() || password.is_empty() {
            return Err(ValidationError::InvalidCredentialOverride);
        }

        Ok(Self {
            username: username.to_string(),
            password: Password::new(password),
        })
    }

    /// Render the `.dockerconfigjson` document for `host`
    pub fn docker_config_json(&self, host: &str) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password.expose()));
        json!({
            "auths": {
                host: {
                    "username": self.username,
                    "password": self.password.expose(),
                    "auth": token,
                }
            }
        })
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_colon() {
        let auth = RegistryAuth::parse("alice:se:cret").unwrap();
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.password.expose(), "se:cret");
    }

    #[test]
    fn test_parse_rejects_empty_halves() {
        for value in [":secret", "alice:", "nocolon"] {
            assert_eq!(
                RegistryAuth::parse(value),
                Err(ValidationError::InvalidCredentialOverride)
            );
        }
    }

    #[test]
    fn test_password_redacted() {
        let auth = RegistryAuth::parse("alice:hunter2").unwrap();
        let debug = format!("{:?}", auth);
        assert!(!debug.contains("hunter2"));
        assert_eq!(auth.password.to_string(), "[REDACTED]");
    }

    #[test]
    fn test_docker_config_json_layout() {
        let auth = RegistryAuth::parse("alice:secret").unwrap();
        let doc: serde_json::Value =
            serde_json::from_str(&auth.docker_config_json("registry.local:5000")).unwrap();

        let entry = &doc["auths"]["registry.local:5000"];
        assert_eq!(entry["username"], "alice");
        assert_eq!(entry["password"], "secret");
        assert_eq!(entry["auth"], "YWxpY2U6c2VjcmV0");
    }
}
