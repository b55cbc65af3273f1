//! Anonymous-token bootstrap. A fresh visitor token is fetched for every
//! request so consecutive conversations do not share an upstream identity.
//! Failure here is never surfaced: the caller falls back to the configured
//! token and carries on.

use std::time::Duration;

use serde::Deserialize;

use crate::dispatch::browser_headers;

const AUTH_PATH: &str = "/api/v1/auths/";
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct AuthResponse {
    #[serde(default)]
    token: String,
}

/// Fetch a visitor token from the upstream auth endpoint. Any failure
/// (network, non-200, malformed body, empty token) returns `None`.
pub async fn fetch_anon_token(client: &reqwest::Client, origin: &str) -> Option<String> {
    let url = format!("{origin}{AUTH_PATH}");

    let response = client
        .get(&url)
        .headers(browser_headers(origin, None))
        .timeout(AUTH_TIMEOUT)
        .send()
        .await
        .map_err(|error| {
            tracing::debug!(%error, "anonymous token request failed");
        })
        .ok()?;

    if !response.status().is_success() {
        tracing::debug!(status = %response.status(), "anonymous token endpoint refused");
        return None;
    }

    let body = response
        .json::<AuthResponse>()
        .await
        .map_err(|error| {
            tracing::debug!(%error, "anonymous token body unparseable");
        })
        .ok()?;

    if body.token.is_empty() {
        tracing::debug!("anonymous token endpoint returned an empty token");
        return None;
    }

    Some(body.token)
}
