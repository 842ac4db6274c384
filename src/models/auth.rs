//! Authentication configuration for remote source fetching.
//!
//! Stored as a tagged JSON object and dispatched exactly once into request
//! headers at fetch time.

use std::collections::HashMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

/// How to authenticate against a remote source URL.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum AuthConfig {
    /// No authentication.
    #[default]
    None,
    /// HTTP basic auth.
    Basic { username: String, password: String },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// A single named header carrying an API key.
    ApiKey { header: String, key: String },
    /// Arbitrary custom headers.
    CustomHeaders { headers: HashMap<String, String> },
}

impl AuthConfig {
    /// Build the request headers this auth config contributes.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            AuthConfig::None => Vec::new(),
            AuthConfig::Basic { username, password } => {
                let credentials = base64::engine::general_purpose::STANDARD
                    .encode(format!("{}:{}", username, password));
                vec![("Authorization".to_string(), format!("Basic {}", credentials))]
            }
            AuthConfig::Bearer { token } => {
                vec![("Authorization".to_string(), format!("Bearer {}", token))]
            }
            AuthConfig::ApiKey { header, key } => vec![(header.clone(), key.clone())],
            AuthConfig::CustomHeaders { headers } => {
                headers.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
            }
        }
    }

    /// Short label recorded in ImportFile metadata (never the secret itself).
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::None => "none",
            AuthConfig::Basic { .. } => "basic",
            AuthConfig::Bearer { .. } => "bearer",
            AuthConfig::ApiKey { .. } => "api-key",
            AuthConfig::CustomHeaders { .. } => "custom-headers",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_auth_header() {
        let auth = AuthConfig::Basic {
            username: "user".into(),
            password: "pass".into(),
        };
        let headers = auth.headers();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].0, "Authorization");
        // base64("user:pass")
        assert_eq!(headers[0].1, "Basic dXNlcjpwYXNz");
    }

    #[test]
    fn test_bearer_header() {
        let auth = AuthConfig::Bearer {
            token: "tok123".into(),
        };
        assert_eq!(
            auth.headers(),
            vec![("Authorization".to_string(), "Bearer tok123".to_string())]
        );
    }

    #[test]
    fn test_api_key_header() {
        let auth = AuthConfig::ApiKey {
            header: "X-Api-Key".into(),
            key: "secret".into(),
        };
        assert_eq!(
            auth.headers(),
            vec![("X-Api-Key".to_string(), "secret".to_string())]
        );
    }

    #[test]
    fn test_tagged_json_round_trip() {
        let auth = AuthConfig::Bearer {
            token: "tok".into(),
        };
        let json = serde_json::to_string(&auth).unwrap();
        assert!(json.contains(r#""type":"bearer""#));
        let back: AuthConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, auth);
    }

    #[test]
    fn test_kind_never_leaks_secret() {
        let auth = AuthConfig::Bearer {
            token: "very-secret".into(),
        };
        assert_eq!(auth.kind(), "bearer");
    }
}
