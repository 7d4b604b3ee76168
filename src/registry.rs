//! Registry bearer-token negotiation.
//!
//! OCI registries answer unauthenticated blob requests with
//! `401 Unauthorized` and a `WWW-Authenticate: Bearer realm=...` challenge.
//! This module parses that challenge and trades it for a bearer token at the
//! declared realm.

use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, UbError};

pub(crate) const USER_AGENT: &str = concat!("ub/", env!("CARGO_PKG_VERSION"));

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

static CHALLENGE_PARAM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([a-zA-Z_]+)="([^"]*)""#).expect("challenge param pattern"));

/// Parse a bearer challenge. The scheme match is case-insensitive and extra
/// whitespace is tolerated; a missing `realm` is fatal.
pub fn parse_bearer_challenge(challenge: &str) -> Result<BearerChallenge> {
    let challenge = challenge.trim();
    if challenge.is_empty() {
        return Err(UbError::RegistryAuth(
            "missing WWW-Authenticate challenge".to_string(),
        ));
    }
    if !challenge.to_lowercase().starts_with("bearer ") {
        return Err(UbError::RegistryAuth(format!(
            "unsupported auth challenge {challenge:?}"
        )));
    }

    let params = &challenge["bearer ".len()..];
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for captures in CHALLENGE_PARAM.captures_iter(params) {
        let value = captures[2].to_string();
        match captures[1].to_lowercase().as_str() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    let realm = realm
        .filter(|realm| !realm.trim().is_empty())
        .ok_or_else(|| UbError::RegistryAuth("auth challenge missing realm".to_string()))?;

    Ok(BearerChallenge {
        realm,
        service: service.filter(|service| !service.is_empty()),
        scope: scope.filter(|scope| !scope.is_empty()),
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        if !self.token.trim().is_empty() {
            return Some(self.token);
        }
        if !self.access_token.trim().is_empty() {
            return Some(self.access_token);
        }
        None
    }
}

/// GET the challenge realm with the declared service and scope, expecting a
/// JSON body carrying `token` or `access_token`.
pub async fn fetch_bearer_token(
    client: &reqwest::Client,
    cancel: &CancellationToken,
    challenge: &str,
) -> Result<String> {
    let parsed = parse_bearer_challenge(challenge)?;

    let mut token_url = reqwest::Url::parse(&parsed.realm).map_err(|err| {
        UbError::RegistryAuth(format!("invalid token realm {:?}: {err}", parsed.realm))
    })?;
    {
        let mut query = token_url.query_pairs_mut();
        if let Some(service) = &parsed.service {
            query.append_pair("service", service);
        }
        if let Some(scope) = &parsed.scope {
            query.append_pair("scope", scope);
        }
    }

    request_token(client, cancel, token_url).await
}

/// GET a token endpoint and extract the bearer token from its JSON body.
pub(crate) async fn request_token(
    client: &reqwest::Client,
    cancel: &CancellationToken,
    token_url: reqwest::Url,
) -> Result<String> {
    let request = client
        .get(token_url)
        .header(reqwest::header::USER_AGENT, USER_AGENT);
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(UbError::Canceled),
        response = request.send() => response?,
    };

    let status = response.status();
    if !status.is_success() {
        return Err(UbError::RegistryAuth(format!(
            "token endpoint returned status {}",
            status.as_u16()
        )));
    }

    let body: TokenResponse = response.json().await?;
    body.into_token()
        .ok_or_else(|| UbError::RegistryAuth("token response missing token".to_string()))
}
