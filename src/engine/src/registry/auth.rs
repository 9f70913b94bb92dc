//! Registry token authentication.
//!
//! Registries answer unauthenticated requests with a `WWW-Authenticate:
//! Bearer …` challenge naming a token endpoint. The client fetches a
//! token scoped to the repository (`repository:<name>:pull,push`) and
//! retries with it; credentials, when configured, ride along as basic
//! auth on the token request.

use kubeimage_core::{EngineError, Result};
use serde::Deserialize;
use url::Url;

/// Optional username/password for the token endpoint.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Read `KUBEIMAGE_REGISTRY_USERNAME` / `KUBEIMAGE_REGISTRY_PASSWORD`.
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("KUBEIMAGE_REGISTRY_USERNAME").ok()?;
        let password = std::env::var("KUBEIMAGE_REGISTRY_PASSWORD").ok()?;
        Some(Self { username, password })
    }
}

/// Parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
}

impl BearerChallenge {
    /// Parse a challenge header value; `None` for non-bearer schemes.
    pub fn parse(header: &str) -> Option<Self> {
        let rest = header.trim();
        let rest = rest
            .strip_prefix("Bearer ")
            .or_else(|| rest.strip_prefix("bearer "))?;

        let mut realm = None;
        let mut service = None;
        for part in rest.split(',') {
            let (key, value) = part.trim().split_once('=')?;
            let value = value.trim().trim_matches('"');
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                _ => {}
            }
        }
        Some(BearerChallenge {
            realm: realm?,
            service,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Fetch a bearer token for `scope` from the challenge's realm.
pub async fn fetch_token(
    http: &reqwest::Client,
    registry: &str,
    challenge: &BearerChallenge,
    scope: &str,
    credentials: Option<&Credentials>,
) -> Result<String> {
    let mut url = Url::parse(&challenge.realm).map_err(|e| EngineError::Registry {
        registry: registry.to_string(),
        message: format!("invalid token realm '{}': {}", challenge.realm, e),
    })?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = &challenge.service {
            query.append_pair("service", service);
        }
        query.append_pair("scope", scope);
    }

    let mut request = http.get(url);
    if let Some(creds) = credentials {
        request = request.basic_auth(&creds.username, Some(&creds.password));
    }

    let response = request.send().await.map_err(|e| EngineError::Registry {
        registry: registry.to_string(),
        message: format!("token request failed: {}", e),
    })?;
    if !response.status().is_success() {
        return Err(EngineError::Registry {
            registry: registry.to_string(),
            message: format!("token endpoint returned {}", response.status()),
        });
    }

    let body: TokenResponse = response.json().await.map_err(|e| EngineError::Registry {
        registry: registry.to_string(),
        message: format!("invalid token response: {}", e),
    })?;
    body.token
        .or(body.access_token)
        .ok_or_else(|| EngineError::Registry {
            registry: registry.to_string(),
            message: "token response carried no token".to_string(),
        })
}

/// Scope string for one repository.
pub fn repository_scope(repository: &str) -> String {
    format!("repository:{}:pull,push", repository)
}
