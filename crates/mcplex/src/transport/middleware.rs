//! Composable HTTP middlewares for the reqwest-backed transports,
//! built on `reqwest-middleware` so they stack with any other
//! middleware via `ClientBuilder::with`.
//!
//! ```ignore
//! let client = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
//!     .with(HttpTraceMiddleware::default())
//!     .with(AuthorizationMiddleware::new(manager))
//!     .build();
//! let transport = StreamableHttpClientTransport::with_client(client, config);
//! ```
use std::sync::Arc;

use http::Extensions;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next};

use super::auth::{AuthError, AuthFlowOutcome, AuthorizationManager};

/// Pulls the `resource_metadata` attribute out of a `WWW-Authenticate`
/// challenge, quoted or not.
fn parse_resource_metadata(www_authenticate: &str) -> Option<url::Url> {
    let key = "resource_metadata=";
    let position = www_authenticate.find(key)?;
    let rest = &www_authenticate[position + key.len()..];
    let value = if let Some(quoted) = rest.strip_prefix('"') {
        &quoted[..quoted.find('"')?]
    } else {
        let end = rest
            .find(|c: char| c.is_whitespace() || c == ',')
            .unwrap_or(rest.len());
        &rest[..end]
    };
    url::Url::parse(value).ok()
}

/// Injects the bearer token and transparently re-authorizes on 401,
/// retrying the request exactly once.
pub struct AuthorizationMiddleware {
    manager: Arc<AuthorizationManager>,
}

impl AuthorizationMiddleware {
    pub fn new(manager: Arc<AuthorizationManager>) -> Self {
        Self { manager }
    }

    fn bearer(token: &str) -> Option<http::HeaderValue> {
        http::HeaderValue::try_from(format!("Bearer {token}")).ok()
    }

    async fn apply_bearer_token(&self, request: &mut Request) {
        if let Some(token) = AuthorizationManager::access_token(&self.manager).await {
            if let Some(value) = Self::bearer(&token) {
                request.headers_mut().insert(http::header::AUTHORIZATION, value);
            }
        }
    }
}

#[async_trait::async_trait]
impl Middleware for AuthorizationMiddleware {
    async fn handle(
        &self,
        mut request: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        self.apply_bearer_token(&mut request).await;
        let url = request.url().clone();
        let retry_request = request.try_clone();
        let response = next.clone().run(request, extensions).await?;
        if response.status() != reqwest::StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        // a streaming body cannot be replayed; surface the 401 as-is
        let Some(mut retry_request) = retry_request else {
            return Ok(response);
        };
        let resource_metadata_url = response
            .headers()
            .get(http::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_resource_metadata);
        match AuthorizationManager::authorize(&self.manager, None, resource_metadata_url).await {
            Ok(AuthFlowOutcome::Authorized) => {}
            Ok(AuthFlowOutcome::Redirect(authorization_url)) => {
                return Err(reqwest_middleware::Error::middleware(
                    AuthError::Unauthorized(format!(
                        "authorization required, redirect initiated: {authorization_url}"
                    )),
                ));
            }
            Err(error) => {
                return Err(reqwest_middleware::Error::middleware(
                    AuthError::Unauthorized(format!("Failed to re-authenticate: {error}")),
                ));
            }
        }
        self.apply_bearer_token(&mut retry_request).await;
        tracing::debug!(%url, "retrying request with refreshed credentials");
        let retried = next.run(retry_request, extensions).await?;
        if retried.status() == reqwest::StatusCode::UNAUTHORIZED {
            // one retry is the budget; a second 401 is terminal
            return Err(reqwest_middleware::Error::middleware(
                AuthError::Unauthorized(format!("Authentication failed for {url}")),
            ));
        }
        Ok(retried)
    }
}

/// Logs one event per request: method, URL, status and duration.
/// Statuses below `status_level` stay quiet; transport errors are
/// always logged.
pub struct HttpTraceMiddleware {
    pub status_level: u16,
    pub log_headers: bool,
}

impl Default for HttpTraceMiddleware {
    fn default() -> Self {
        Self {
            status_level: 0,
            log_headers: false,
        }
    }
}

impl HttpTraceMiddleware {
    pub fn with_status_level(status_level: u16) -> Self {
        Self {
            status_level,
            log_headers: false,
        }
    }
}

#[async_trait::async_trait]
impl Middleware for HttpTraceMiddleware {
    async fn handle(
        &self,
        request: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        let method = request.method().clone();
        let url = request.url().clone();
        let request_headers = self.log_headers.then(|| format!("{:?}", request.headers()));
        let started = std::time::Instant::now();
        let result = next.run(request, extensions).await;
        let duration_ms = started.elapsed().as_millis();
        match &result {
            Ok(response) => {
                let status = response.status();
                if status.as_u16() >= self.status_level {
                    tracing::info!(
                        %method,
                        %url,
                        status = status.as_u16(),
                        status_text = status.canonical_reason().unwrap_or(""),
                        duration_ms,
                        request_headers,
                        response_headers = self
                            .log_headers
                            .then(|| format!("{:?}", response.headers())),
                        "http request"
                    );
                }
            }
            Err(error) => {
                tracing::error!(%method, %url, duration_ms, %error, "http request failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resource_metadata_quoted() {
        let header = r#"Bearer realm="mcp", resource_metadata="https://api.example.com/.well-known/oauth-protected-resource""#;
        assert_eq!(
            parse_resource_metadata(header).unwrap().as_str(),
            "https://api.example.com/.well-known/oauth-protected-resource"
        );
    }

    #[test]
    fn test_parse_resource_metadata_unquoted() {
        let header = "Bearer resource_metadata=https://api.example.com/prm, realm=x";
        assert_eq!(
            parse_resource_metadata(header).unwrap().as_str(),
            "https://api.example.com/prm"
        );
    }

    #[test]
    fn test_parse_resource_metadata_absent() {
        assert!(parse_resource_metadata(r#"Bearer realm="mcp""#).is_none());
    }
}
