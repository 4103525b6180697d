//! OAuth 2.1 client support for the HTTP transports: protected-resource
//! and authorization-server metadata discovery (RFC 9728 / RFC 8414),
//! PKCE authorization-code flow, token exchange and refresh, and
//! dynamic client registration (RFC 7591).
//!
//! The manager holds no durable state of its own; tokens and client
//! information live behind the [`CredentialStore`] plug point.
use std::sync::Arc;

use oauth2::{
    AuthType, AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
    basic::{BasicClient, BasicErrorResponseType},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::common::http_header::HEADER_PROTOCOL_VERSION;
use crate::model::ProtocolVersion;

const WELL_KNOWN_PROTECTED_RESOURCE: &str = "/.well-known/oauth-protected-resource";
const WELL_KNOWN_AUTHORIZATION_SERVER: &str = "/.well-known/oauth-authorization-server";

/// Leeway subtracted from `expires_in` so a token is refreshed before
/// it actually lapses.
const EXPIRY_LEEWAY_SECS: u64 = 60;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("metadata could not be fetched: {0}")]
    MetadataFetch(String),
    #[error("authorization server metadata not found")]
    MetadataNotFound,
    #[error("protected resource {resource} does not cover server {server}")]
    ResourceMismatch { resource: String, server: String },
    #[error("authorization server does not support authorization code with S256")]
    AuthorizationNotSupported,
    #[error("no client information available and the server offers no registration endpoint")]
    NoClientInformation,
    #[error("dynamic client registration failed: {0}")]
    RegistrationFailed(String),
    #[error("no authorization in progress")]
    NoPendingAuthorization,
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("invalid_grant: stored tokens were rejected")]
    InvalidGrant,
    #[error("invalid_client: client credentials were rejected")]
    InvalidClient,
    #[error("unauthorized_client: client may not use this grant")]
    UnauthorizedClient,
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

// ---------------------------------------------------------------------
// wire documents
// ---------------------------------------------------------------------

/// RFC 9728 protected-resource metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    pub resource: Url,
    pub authorization_servers: Vec<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_name: Option<String>,
}

/// The RFC 8414 subset this client consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    pub issuer: Url,
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registration_endpoint: Option<Url>,
    pub response_types_supported: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_challenge_methods_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_methods_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types_supported: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scopes_supported: Option<Vec<String>>,
}

/// Token endpoint response (RFC 6749 §5.1).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OAuthTokens {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Client metadata submitted during dynamic registration (RFC 7591).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientMetadata {
    pub redirect_uris: Vec<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grant_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_types: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Registered client information, stored via the [`CredentialStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthClientInformation {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
}

/// Tokens plus the wall-clock moment they were obtained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTokens {
    pub tokens: OAuthTokens,
    pub obtained_at: std::time::SystemTime,
}

impl StoredTokens {
    pub fn new(tokens: OAuthTokens) -> Self {
        Self {
            tokens,
            obtained_at: std::time::SystemTime::now(),
        }
    }

    pub fn is_expired(&self) -> bool {
        let Some(expires_in) = self.tokens.expires_in else {
            return false;
        };
        let lifetime =
            std::time::Duration::from_secs(expires_in.saturating_sub(EXPIRY_LEEWAY_SECS));
        self.obtained_at
            .elapsed()
            .map(|elapsed| elapsed >= lifetime)
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------
// credential store plug point
// ---------------------------------------------------------------------

/// Durable storage for tokens and client information, keyed per
/// provider instance. Implementations must serialize save/load so
/// concurrent refreshes cannot lose updates.
#[async_trait::async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn load_tokens(&self) -> Option<StoredTokens>;
    async fn save_tokens(&self, tokens: StoredTokens);
    async fn clear_tokens(&self);
    async fn load_client(&self) -> Option<OAuthClientInformation>;
    async fn save_client(&self, client: OAuthClientInformation);
    async fn clear_client(&self);
}

/// Process-local credential store, the default.
#[derive(Default)]
pub struct MemoryCredentialStore {
    inner: tokio::sync::Mutex<MemoryCredentials>,
}

#[derive(Default)]
struct MemoryCredentials {
    tokens: Option<StoredTokens>,
    client: Option<OAuthClientInformation>,
}

#[async_trait::async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load_tokens(&self) -> Option<StoredTokens> {
        self.inner.lock().await.tokens.clone()
    }
    async fn save_tokens(&self, tokens: StoredTokens) {
        self.inner.lock().await.tokens = Some(tokens);
    }
    async fn clear_tokens(&self) {
        self.inner.lock().await.tokens = None;
    }
    async fn load_client(&self) -> Option<OAuthClientInformation> {
        self.inner.lock().await.client.clone()
    }
    async fn save_client(&self, client: OAuthClientInformation) {
        self.inner.lock().await.client = Some(client);
    }
    async fn clear_client(&self) {
        self.inner.lock().await.client = None;
    }
}

// ---------------------------------------------------------------------
// manager
// ---------------------------------------------------------------------

/// How the client authenticates against the token endpoint, in
/// preference order when the server advertises several.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    ClientSecretBasic,
    ClientSecretPost,
    None,
}

impl ClientAuthMethod {
    /// Preference: `client_secret_basic` over `client_secret_post` over
    /// `none`; `client_secret_post` when the server stays silent.
    fn select(advertised: Option<&[String]>) -> Self {
        let Some(advertised) = advertised else {
            return ClientAuthMethod::ClientSecretPost;
        };
        for candidate in ["client_secret_basic", "client_secret_post", "none"] {
            if advertised.iter().any(|m| m == candidate) {
                return match candidate {
                    "client_secret_basic" => ClientAuthMethod::ClientSecretBasic,
                    "client_secret_post" => ClientAuthMethod::ClientSecretPost,
                    _ => ClientAuthMethod::None,
                };
            }
        }
        ClientAuthMethod::ClientSecretPost
    }
}

/// Outcome of [`AuthorizationManager::authorize`].
#[derive(Debug)]
pub enum AuthFlowOutcome {
    /// Valid tokens are in the store.
    Authorized,
    /// The caller must send the user to this URL and feed the resulting
    /// code back in.
    Redirect(Url),
}

/// An authorization round-trip in flight.
#[derive(Debug, Clone)]
pub struct AuthorizationSession {
    pub authorization_url: Url,
    pub code_verifier: String,
    pub state: String,
}

type ResourceValidator = dyn Fn(&Url, &Url) -> Result<(), AuthError> + Send + Sync;

pub struct AuthorizationManager {
    http: reqwest::Client,
    server_url: Url,
    credentials: Arc<dyn CredentialStore>,
    client_metadata: OAuthClientMetadata,
    redirect_uri: Url,
    scopes: Vec<String>,
    validate_resource_url: Option<Box<ResourceValidator>>,
    prm: tokio::sync::RwLock<Option<ProtectedResourceMetadata>>,
    as_metadata: tokio::sync::RwLock<Option<AuthorizationServerMetadata>>,
    pending_verifier: tokio::sync::Mutex<Option<String>>,
}

impl AuthorizationManager {
    pub fn new(
        http: reqwest::Client,
        server_url: Url,
        credentials: Arc<dyn CredentialStore>,
        client_metadata: OAuthClientMetadata,
        redirect_uri: Url,
        scopes: Vec<String>,
    ) -> Self {
        Self {
            http,
            server_url,
            credentials,
            client_metadata,
            redirect_uri,
            scopes,
            validate_resource_url: None,
            prm: Default::default(),
            as_metadata: Default::default(),
            pending_verifier: Default::default(),
        }
    }

    /// Replace the default prefix rule for validating the PRM's
    /// `resource` against the server URL.
    pub fn with_resource_validator(
        mut self,
        validator: impl Fn(&Url, &Url) -> Result<(), AuthError> + Send + Sync + 'static,
    ) -> Self {
        self.validate_resource_url = Some(Box::new(validator));
        self
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.credentials
    }

    /// A non-expired access token, if the store has one.
    pub async fn access_token(&self) -> Option<String> {
        let stored = self.credentials.load_tokens().await?;
        if stored.is_expired() {
            return None;
        }
        Some(stored.tokens.access_token)
    }

    // -- discovery -----------------------------------------------------

    /// `https://host/.well-known/<kind><path-of-base>`, preserving the
    /// base URL's query string.
    fn well_known_url(base: &Url, kind: &str, include_path: bool) -> Result<Url, AuthError> {
        let mut url = base.clone();
        let path = base.path();
        if include_path && path != "/" && !path.is_empty() {
            url.set_path(&format!("{kind}{path}"));
        } else {
            url.set_path(kind);
        }
        url.set_fragment(None);
        Ok(url)
    }

    /// One metadata probe. `Ok(None)` is a definitive 404; transport
    /// errors are retried once without the `MCP-Protocol-Version`
    /// header (some resource servers reject unknown headers at the CORS
    /// layer), and count as "not found" if they persist.
    async fn fetch_metadata<T: serde::de::DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<Option<T>, AuthError> {
        let first = self
            .http
            .get(url.clone())
            .header(HEADER_PROTOCOL_VERSION, ProtocolVersion::LATEST.as_str())
            .send()
            .await;
        let response = match first {
            Ok(response) => response,
            Err(error) => {
                tracing::debug!(%url, %error, "metadata probe failed, retrying without protocol header");
                match self.http.get(url.clone()).send().await {
                    Ok(response) => response,
                    Err(error) => {
                        tracing::debug!(%url, %error, "metadata probe failed twice");
                        return Ok(None);
                    }
                }
            }
        };
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if let Err(error) = response.error_for_status_ref() {
            return Err(AuthError::MetadataFetch(error.to_string()));
        }
        let metadata = response
            .json::<T>()
            .await
            .map_err(|e| AuthError::MetadataFetch(e.to_string()))?;
        Ok(Some(metadata))
    }

    /// RFC 9728 discovery with path-aware probing and root fallback.
    /// `None` means the server exposes no PRM, which is not an error.
    pub async fn discover_protected_resource(
        &self,
        resource_metadata_url: Option<Url>,
    ) -> Result<Option<ProtectedResourceMetadata>, AuthError> {
        if let Some(url) = resource_metadata_url {
            let found = self.fetch_metadata(url).await?;
            *self.prm.write().await = found.clone();
            return Ok(found);
        }
        let path_aware =
            Self::well_known_url(&self.server_url, WELL_KNOWN_PROTECTED_RESOURCE, true)?;
        let mut found = self.fetch_metadata(path_aware).await?;
        if found.is_none() && self.server_url.path() != "/" {
            let root = Self::well_known_url(&self.server_url, WELL_KNOWN_PROTECTED_RESOURCE, false)?;
            found = self.fetch_metadata(root).await?;
        }
        *self.prm.write().await = found.clone();
        Ok(found)
    }

    /// RFC 8414 discovery against one advertised authorization server,
    /// with the same path-aware probing as the PRM.
    pub async fn discover_authorization_server(
        &self,
        authorization_server: &Url,
    ) -> Result<AuthorizationServerMetadata, AuthError> {
        let path_aware =
            Self::well_known_url(authorization_server, WELL_KNOWN_AUTHORIZATION_SERVER, true)?;
        let mut found = self
            .fetch_metadata::<AuthorizationServerMetadata>(path_aware)
            .await?;
        if found.is_none() && authorization_server.path() != "/" {
            let root =
                Self::well_known_url(authorization_server, WELL_KNOWN_AUTHORIZATION_SERVER, false)?;
            found = self.fetch_metadata(root).await?;
        }
        let metadata = found.ok_or(AuthError::MetadataNotFound)?;
        *self.as_metadata.write().await = Some(metadata.clone());
        Ok(metadata)
    }

    /// The PRM's `resource` must cover the server URL: same origin and
    /// a path prefix. A caller-supplied validator replaces this rule.
    fn validate_resource(&self, resource: &Url) -> Result<(), AuthError> {
        if let Some(validator) = &self.validate_resource_url {
            return validator(resource, &self.server_url);
        }
        let same_origin = resource.scheme() == self.server_url.scheme()
            && resource.host_str() == self.server_url.host_str()
            && resource.port_or_known_default() == self.server_url.port_or_known_default();
        let path_prefix = self
            .server_url
            .path()
            .starts_with(resource.path().trim_end_matches('/'));
        if same_origin && path_prefix {
            Ok(())
        } else {
            Err(AuthError::ResourceMismatch {
                resource: resource.to_string(),
                server: self.server_url.to_string(),
            })
        }
    }

    // -- client registration -------------------------------------------

    /// Stored client information, or a fresh dynamic registration when
    /// the server offers one.
    pub async fn ensure_client(
        &self,
        metadata: &AuthorizationServerMetadata,
    ) -> Result<OAuthClientInformation, AuthError> {
        if let Some(client) = self.credentials.load_client().await {
            return Ok(client);
        }
        let Some(registration_endpoint) = &metadata.registration_endpoint else {
            return Err(AuthError::NoClientInformation);
        };
        let mut client_metadata = self.client_metadata.clone();
        if client_metadata.redirect_uris.is_empty() {
            client_metadata.redirect_uris = vec![self.redirect_uri.clone()];
        }
        tracing::info!(%registration_endpoint, "registering oauth client dynamically");
        let response = self
            .http
            .post(registration_endpoint.clone())
            .json(&client_metadata)
            .send()
            .await
            .map_err(|e| AuthError::RegistrationFailed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthError::RegistrationFailed(format!(
                "registration endpoint returned {}",
                response.status()
            )));
        }
        let client: OAuthClientInformation = response
            .json()
            .await
            .map_err(|e| AuthError::RegistrationFailed(e.to_string()))?;
        self.credentials.save_client(client.clone()).await;
        Ok(client)
    }

    // -- PKCE authorization --------------------------------------------

    fn oauth_endpoints(
        metadata: &AuthorizationServerMetadata,
        client: &OAuthClientInformation,
        auth_method: ClientAuthMethod,
        redirect_uri: &Url,
    ) -> oauth2::basic::BasicClient<
        oauth2::EndpointSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointNotSet,
        oauth2::EndpointSet,
    > {
        let mut oauth_client = BasicClient::new(ClientId::new(client.client_id.clone()))
            .set_auth_uri(AuthUrl::from_url(metadata.authorization_endpoint.clone()))
            .set_token_uri(TokenUrl::from_url(metadata.token_endpoint.clone()))
            .set_redirect_uri(RedirectUrl::from_url(redirect_uri.clone()))
            .set_auth_type(match auth_method {
                ClientAuthMethod::ClientSecretBasic => AuthType::BasicAuth,
                ClientAuthMethod::ClientSecretPost | ClientAuthMethod::None => {
                    AuthType::RequestBody
                }
            });
        if let (Some(secret), true) = (
            client.client_secret.clone(),
            auth_method != ClientAuthMethod::None,
        ) {
            oauth_client = oauth_client.set_client_secret(ClientSecret::new(secret));
        }
        oauth_client
    }

    fn selected_auth_method(metadata: &AuthorizationServerMetadata) -> ClientAuthMethod {
        ClientAuthMethod::select(metadata.token_endpoint_auth_methods_supported.as_deref())
    }

    /// Build the PKCE authorization URL. Fails when the server does not
    /// advertise `code` + `S256`.
    pub async fn start_authorization(&self) -> Result<AuthorizationSession, AuthError> {
        let metadata = self
            .as_metadata
            .read()
            .await
            .clone()
            .ok_or(AuthError::MetadataNotFound)?;
        if !metadata.response_types_supported.iter().any(|t| t == "code") {
            return Err(AuthError::AuthorizationNotSupported);
        }
        if !metadata
            .code_challenge_methods_supported
            .as_ref()
            .is_some_and(|methods| methods.iter().any(|m| m == "S256"))
        {
            return Err(AuthError::AuthorizationNotSupported);
        }
        let client = self.ensure_client(&metadata).await?;
        let auth_method = Self::selected_auth_method(&metadata);
        let oauth_client =
            Self::oauth_endpoints(&metadata, &client, auth_method, &self.redirect_uri);

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = oauth_client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge)
            .add_scopes(self.scopes.iter().cloned().map(Scope::new));
        if let Some(resource) = self.resource_parameter().await {
            request = request.add_extra_param("resource", resource);
        }
        if self.scopes.iter().any(|s| s == "offline_access") {
            request = request.add_extra_param("prompt", "consent");
        }
        let (authorization_url, state) = request.url();
        let session = AuthorizationSession {
            authorization_url,
            code_verifier: pkce_verifier.secret().clone(),
            state: state.secret().clone(),
        };
        *self.pending_verifier.lock().await = Some(session.code_verifier.clone());
        Ok(session)
    }

    /// The RFC 8707 `resource` parameter: the PRM's `resource` value
    /// when one was discovered.
    async fn resource_parameter(&self) -> Option<String> {
        self.prm
            .read()
            .await
            .as_ref()
            .map(|prm| prm.resource.to_string())
    }

    // -- token endpoint ------------------------------------------------

    async fn oauth_http(
        &self,
        request: oauth2::HttpRequest,
    ) -> Result<oauth2::HttpResponse, AuthError> {
        let reqwest_request = reqwest::Request::try_from(request)?;
        let response = self.http.execute(reqwest_request).await?;
        let mut builder = http::Response::builder().status(response.status().as_u16());
        for (name, value) in response.headers() {
            builder = builder.header(name, value);
        }
        let body = response.bytes().await?;
        builder
            .body(body.to_vec())
            .map_err(|e| AuthError::TokenExchange(e.to_string()))
    }

    fn map_token_error<RE: std::error::Error>(
        error: oauth2::RequestTokenError<
            RE,
            oauth2::StandardErrorResponse<BasicErrorResponseType>,
        >,
    ) -> AuthError {
        match error {
            oauth2::RequestTokenError::ServerResponse(response) => match response.error() {
                BasicErrorResponseType::InvalidGrant => AuthError::InvalidGrant,
                BasicErrorResponseType::InvalidClient => AuthError::InvalidClient,
                BasicErrorResponseType::UnauthorizedClient => AuthError::UnauthorizedClient,
                other => AuthError::TokenExchange(format!("{other:?}")),
            },
            other => AuthError::TokenExchange(other.to_string()),
        }
    }

    fn tokens_from_response(
        response: &oauth2::basic::BasicTokenResponse,
        previous_refresh_token: Option<String>,
    ) -> OAuthTokens {
        OAuthTokens {
            access_token: response.access_token().secret().clone(),
            token_type: "Bearer".to_string(),
            expires_in: response.expires_in().map(|d| d.as_secs()),
            // a response without a rotation keeps the old refresh token
            refresh_token: response
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(previous_refresh_token),
            scope: response
                .scopes()
                .map(|scopes| {
                    scopes
                        .iter()
                        .map(|s| s.as_str())
                        .collect::<Vec<_>>()
                        .join(" ")
                }),
        }
    }

    /// Exchange an authorization code using the verifier of the pending
    /// session.
    pub async fn exchange_code(&self, code: String) -> Result<OAuthTokens, AuthError> {
        let metadata = self
            .as_metadata
            .read()
            .await
            .clone()
            .ok_or(AuthError::MetadataNotFound)?;
        let client = self.ensure_client(&metadata).await?;
        let verifier = self
            .pending_verifier
            .lock()
            .await
            .take()
            .ok_or(AuthError::NoPendingAuthorization)?;
        let auth_method = Self::selected_auth_method(&metadata);
        let oauth_client =
            Self::oauth_endpoints(&metadata, &client, auth_method, &self.redirect_uri);
        let mut request = oauth_client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier));
        let resource = self.resource_parameter().await;
        if let Some(resource) = &resource {
            request = request.add_extra_param("resource", resource.as_str());
        }
        let response = request
            .request_async(&|req| self.oauth_http(req))
            .await
            .map_err(Self::map_token_error)?;
        let tokens = Self::tokens_from_response(&response, None);
        self.credentials
            .save_tokens(StoredTokens::new(tokens.clone()))
            .await;
        Ok(tokens)
    }

    /// Refresh with the stored refresh token. `invalid_grant` clears
    /// the tokens; `invalid_client`/`unauthorized_client` clear tokens
    /// and client information.
    pub async fn refresh_tokens(&self) -> Result<OAuthTokens, AuthError> {
        let metadata = self
            .as_metadata
            .read()
            .await
            .clone()
            .ok_or(AuthError::MetadataNotFound)?;
        let client = self.ensure_client(&metadata).await?;
        let stored = self
            .credentials
            .load_tokens()
            .await
            .ok_or_else(|| AuthError::Unauthorized("no stored tokens".to_string()))?;
        let refresh_token = stored
            .tokens
            .refresh_token
            .clone()
            .ok_or_else(|| AuthError::Unauthorized("no refresh token".to_string()))?;
        let auth_method = Self::selected_auth_method(&metadata);
        let oauth_client =
            Self::oauth_endpoints(&metadata, &client, auth_method, &self.redirect_uri);
        let refresh_token_param = RefreshToken::new(refresh_token.clone());
        let mut request = oauth_client.exchange_refresh_token(&refresh_token_param);
        let resource = self.resource_parameter().await;
        if let Some(resource) = &resource {
            request = request.add_extra_param("resource", resource.as_str());
        }
        let result = request
            .request_async(&|req| self.oauth_http(req))
            .await
            .map_err(Self::map_token_error);
        match result {
            Ok(response) => {
                let tokens = Self::tokens_from_response(&response, Some(refresh_token));
                self.credentials
                    .save_tokens(StoredTokens::new(tokens.clone()))
                    .await;
                Ok(tokens)
            }
            Err(AuthError::InvalidGrant) => {
                self.credentials.clear_tokens().await;
                Err(AuthError::Unauthorized(
                    "refresh token rejected, re-authorization required".to_string(),
                ))
            }
            Err(error @ (AuthError::InvalidClient | AuthError::UnauthorizedClient)) => {
                self.credentials.clear_tokens().await;
                self.credentials.clear_client().await;
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    // -- top-level state machine ---------------------------------------

    /// The whole flow: discover metadata, ensure a client, then either
    /// exchange the supplied code, refresh stored tokens, or hand back
    /// the authorization URL to redirect to.
    pub async fn authorize(
        &self,
        authorization_code: Option<String>,
        resource_metadata_url: Option<Url>,
    ) -> Result<AuthFlowOutcome, AuthError> {
        let prm = self.discover_protected_resource(resource_metadata_url).await?;
        if let Some(prm) = &prm {
            self.validate_resource(&prm.resource)?;
        }
        let authorization_server = prm
            .as_ref()
            .and_then(|prm| prm.authorization_servers.first().cloned())
            .unwrap_or_else(|| self.server_url.clone());
        let metadata = self
            .discover_authorization_server(&authorization_server)
            .await?;
        self.ensure_client(&metadata).await?;

        if let Some(code) = authorization_code {
            self.exchange_code(code).await?;
            return Ok(AuthFlowOutcome::Authorized);
        }
        let has_refresh_token = self
            .credentials
            .load_tokens()
            .await
            .is_some_and(|stored| stored.tokens.refresh_token.is_some());
        if has_refresh_token {
            self.refresh_tokens().await?;
            return Ok(AuthFlowOutcome::Authorized);
        }
        let session = self.start_authorization().await?;
        Ok(AuthFlowOutcome::Redirect(session.authorization_url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_method_preference() {
        let advertised = vec![
            "none".to_string(),
            "client_secret_post".to_string(),
            "client_secret_basic".to_string(),
        ];
        assert_eq!(
            ClientAuthMethod::select(Some(&advertised)),
            ClientAuthMethod::ClientSecretBasic
        );
        let advertised = vec!["none".to_string(), "client_secret_post".to_string()];
        assert_eq!(
            ClientAuthMethod::select(Some(&advertised)),
            ClientAuthMethod::ClientSecretPost
        );
        let advertised = vec!["none".to_string()];
        assert_eq!(ClientAuthMethod::select(Some(&advertised)), ClientAuthMethod::None);
        assert_eq!(ClientAuthMethod::select(None), ClientAuthMethod::ClientSecretPost);
        let advertised = vec!["private_key_jwt".to_string()];
        assert_eq!(
            ClientAuthMethod::select(Some(&advertised)),
            ClientAuthMethod::ClientSecretPost
        );
    }

    #[test]
    fn test_well_known_url_path_aware() {
        let base = Url::parse("https://resource.example.com/path/name?tenant=1").unwrap();
        let url = AuthorizationManager::well_known_url(
            &base,
            WELL_KNOWN_PROTECTED_RESOURCE,
            true,
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://resource.example.com/.well-known/oauth-protected-resource/path/name?tenant=1"
        );
        let root = AuthorizationManager::well_known_url(
            &base,
            WELL_KNOWN_PROTECTED_RESOURCE,
            false,
        )
        .unwrap();
        assert_eq!(
            root.as_str(),
            "https://resource.example.com/.well-known/oauth-protected-resource?tenant=1"
        );
    }

    #[test]
    fn test_stored_tokens_expiry() {
        let mut stored = StoredTokens::new(OAuthTokens {
            access_token: "t".into(),
            token_type: "Bearer".into(),
            expires_in: Some(3600),
            refresh_token: None,
            scope: None,
        });
        assert!(!stored.is_expired());
        stored.obtained_at = std::time::SystemTime::now() - std::time::Duration::from_secs(3600);
        assert!(stored.is_expired());
        stored.tokens.expires_in = None;
        assert!(!stored.is_expired());
    }
}
