// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Credential exchange flows.
//!
//! Each operation is a short-lived flow that ends in [`Signer`] minting
//! tokens:
//!
//! - **OIDC**: [`Exchanger::auth_code_url`], [`Exchanger::exchange_code`],
//!   [`Exchanger::exchange_token`]
//! - **Local login**: [`Exchanger::login_local`]
//! - **Client credentials**: [`Exchanger::login_client`]
//! - **Authorization code**: [`Exchanger::validate_authorization_request`],
//!   [`Exchanger::create_authorization_code`],
//!   [`Exchanger::redeem_authorization_code`]
//!
//! Client grant and scope allow-lists are enforced here for every
//! client-bound flow, not only at the HTTP boundary.

use std::sync::Arc;

use axum::http::StatusCode;
use chrono::Utc;
use tracing::info;

use super::claims::{
    split_scope, ClaimSet, CLAIM_AUTH_METHOD, CLAIM_AZP, CLAIM_EMAIL, CLAIM_ENTITLEMENTS,
    CLAIM_GRANT_TYPE, CLAIM_ROLES, CLAIM_SCOPE, CLAIM_SUBJECT, REGISTERED_CLAIMS,
};
use super::clients::{
    AuthClient, ClientRegistry, GRANT_AUTHORIZATION_CODE, GRANT_CLIENT_CREDENTIALS,
    GRANT_PASSWORD, IDENTITY_SCOPES, SCOPE_EMAIL, SCOPE_ENTITLEMENTS, SCOPE_OPENID,
    SCOPE_PROFILE, SCOPE_ROLES,
};
use super::code::{
    AuthorizationCodeClaims, AuthorizationCodeCodec, CodecError, RedeemedCodes,
    DEFAULT_CODE_TTL_SECONDS,
};
use super::entitlements;
use super::error::{AuthError, OAuthError};
use super::oidc::{OidcError, OidcProvider};
use super::pkce::{self, PkceError};
use super::provider::{Identity, ProviderError, ScopeProvider};
use super::signer::{SignError, Signer, PASSTHROUGH_CLAIMS};

pub const AUTH_METHOD_PASSWORD: &str = "password";
pub const AUTH_METHOD_OIDC: &str = "oidc";
pub const AUTH_METHOD_CLIENT_SECRET: &str = "client_secret";

/// Scopes requested for browser sessions.
pub const SESSION_SCOPE: &str = "openid profile email roles entitlements";

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("{0} is not configured")]
    NotConfigured(&'static str),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("unknown client: {0}")]
    UnknownClient(String),

    #[error("client authentication failed for {0}")]
    InvalidClient(String),

    #[error("client {client_id} may not use grant type {grant_type}")]
    UnauthorizedClient {
        client_id: String,
        grant_type: &'static str,
    },

    #[error("scope {scope} is not permitted for client {client_id}")]
    InvalidScope { client_id: String, scope: String },

    #[error("redirect_uri {0} is not registered for the client")]
    UnregisteredRedirect(String),

    #[error("redirect_uri does not match the authorization request")]
    RedirectMismatch,

    #[error("client_id does not match the authorization request")]
    ClientMismatch,

    #[error("authorization code rejected: {0}")]
    Code(#[from] CodecError),

    #[error("authorization code was already redeemed")]
    CodeReused,

    #[error("PKCE verification failed: {0}")]
    Pkce(#[from] PkceError),

    #[error("client {0} requires PKCE but no code_challenge was bound")]
    PkceRequired(String),

    #[error("subject {0} no longer resolves")]
    UnknownSubject(String),

    #[error("identity store failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("upstream identity provider failed: {0}")]
    Oidc(#[from] OidcError),

    #[error("failed to sign token: {0}")]
    Sign(#[from] SignError),

    #[error("failed to encode authorization code: {0}")]
    CodeEncoding(CodecError),
}

impl ExchangeError {
    /// RFC 6749 error code.
    pub fn oauth_error_code(&self) -> &'static str {
        match self {
            ExchangeError::NotConfigured(_) => "unsupported_grant_type",
            ExchangeError::InvalidCredentials
            | ExchangeError::RedirectMismatch
            | ExchangeError::ClientMismatch
            | ExchangeError::Code(_)
            | ExchangeError::CodeReused
            | ExchangeError::Pkce(_)
            | ExchangeError::PkceRequired(_)
            | ExchangeError::UnknownSubject(_) => "invalid_grant",
            ExchangeError::UnknownClient(_) | ExchangeError::InvalidClient(_) => "invalid_client",
            ExchangeError::UnauthorizedClient { .. } => "unauthorized_client",
            ExchangeError::InvalidScope { .. } => "invalid_scope",
            ExchangeError::UnregisteredRedirect(_) => "invalid_request",
            ExchangeError::Oidc(OidcError::Token(_) | OidcError::TokenEndpoint(_)) => {
                "invalid_grant"
            }
            ExchangeError::Provider(_)
            | ExchangeError::Oidc(_)
            | ExchangeError::Sign(_)
            | ExchangeError::CodeEncoding(_) => "server_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ExchangeError::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            ExchangeError::InvalidCredentials => StatusCode::UNAUTHORIZED,
            ExchangeError::Oidc(OidcError::Token(_)) => StatusCode::UNAUTHORIZED,
            ExchangeError::Provider(_)
            | ExchangeError::Oidc(_)
            | ExchangeError::Sign(_)
            | ExchangeError::CodeEncoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    /// Message safe to show the caller. Internal detail stays in `Display`.
    pub fn public_message(&self) -> String {
        match self {
            ExchangeError::NotConfigured(what) => format!("{what} is not available"),
            ExchangeError::InvalidCredentials => "Invalid username or password".to_string(),
            ExchangeError::UnknownClient(_) | ExchangeError::InvalidClient(_) => {
                "Client authentication failed".to_string()
            }
            ExchangeError::UnauthorizedClient { grant_type, .. } => {
                format!("Client is not allowed to use grant type {grant_type}")
            }
            ExchangeError::InvalidScope { scope, .. } => {
                format!("Scope {scope} is not permitted for this client")
            }
            ExchangeError::UnregisteredRedirect(_) => {
                "redirect_uri is not registered for this client".to_string()
            }
            ExchangeError::RedirectMismatch => {
                "redirect_uri does not match the authorization request".to_string()
            }
            ExchangeError::ClientMismatch => {
                "Authorization code was issued to another client".to_string()
            }
            ExchangeError::Code(_) | ExchangeError::CodeReused => {
                "Authorization code is invalid or expired".to_string()
            }
            ExchangeError::Pkce(PkceError::UnsupportedMethod(method)) => {
                format!("Unsupported code_challenge_method: {method}")
            }
            ExchangeError::Pkce(PkceError::MissingVerifier) => {
                "code_verifier is required".to_string()
            }
            ExchangeError::Pkce(_) => "code_verifier is invalid".to_string(),
            ExchangeError::PkceRequired(_) => "code_challenge is required".to_string(),
            ExchangeError::UnknownSubject(_) => "Subject is no longer valid".to_string(),
            ExchangeError::Oidc(OidcError::Token(_) | OidcError::TokenEndpoint(_)) => {
                "Identity provider rejected the login".to_string()
            }
            ExchangeError::Provider(_) | ExchangeError::Oidc(_) => {
                "Identity provider unavailable".to_string()
            }
            ExchangeError::Sign(_) | ExchangeError::CodeEncoding(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl From<ExchangeError> for OAuthError {
    fn from(err: ExchangeError) -> Self {
        OAuthError::new(err.status_code(), err.oauth_error_code(), err.public_message())
    }
}

impl From<AuthError> for ExchangeError {
    fn from(err: AuthError) -> Self {
        ExchangeError::Oidc(OidcError::Token(err))
    }
}

/// Tokens issued by a flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSet {
    pub access_token: String,
    pub id_token: Option<String>,
    pub expires_in: i64,
    /// Granted scope, space separated
    pub scope: Option<String>,
}

/// Orchestrates every credential exchange.
pub struct Exchanger {
    signer: Option<Signer>,
    provider: Option<Arc<dyn ScopeProvider>>,
    oidc: Option<OidcProvider>,
    clients: ClientRegistry,
    codec: AuthorizationCodeCodec,
    redeemed: RedeemedCodes,
}

impl Exchanger {
    /// `signer` is `None` when no keys are configured; every flow then fails.
    pub fn new(signer: Option<Signer>, codec: AuthorizationCodeCodec) -> Self {
        Self {
            signer,
            provider: None,
            oidc: None,
            clients: ClientRegistry::default(),
            codec,
            redeemed: RedeemedCodes::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ScopeProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_oidc(mut self, oidc: OidcProvider) -> Self {
        self.oidc = Some(oidc);
        self
    }

    pub fn with_clients(mut self, clients: ClientRegistry) -> Self {
        self.clients = clients;
        self
    }

    pub fn is_auth_enabled(&self) -> bool {
        self.signer.is_some()
    }

    pub fn has_local_login(&self) -> bool {
        self.provider.is_some()
    }

    pub fn oidc(&self) -> Option<&OidcProvider> {
        self.oidc.as_ref()
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    fn signer(&self) -> Result<&Signer, ExchangeError> {
        self.signer
            .as_ref()
            .ok_or(ExchangeError::NotConfigured("authentication"))
    }

    fn provider(&self) -> Result<&dyn ScopeProvider, ExchangeError> {
        self.provider
            .as_deref()
            .ok_or(ExchangeError::NotConfigured("local login"))
    }

    fn upstream(&self) -> Result<&OidcProvider, ExchangeError> {
        self.oidc
            .as_ref()
            .ok_or(ExchangeError::NotConfigured("OIDC login"))
    }

    // ---- OIDC ----

    /// Provider redirect URL, or `None` when OIDC is not configured.
    pub fn auth_code_url(&self, state: &str) -> Result<Option<String>, ExchangeError> {
        self.oidc
            .as_ref()
            .map(|oidc| oidc.auth_code_url(state))
            .transpose()
            .map_err(ExchangeError::from)
    }

    /// Trade the provider's code for its raw identity token.
    pub async fn exchange_code(&self, code: &str) -> Result<String, ExchangeError> {
        Ok(self.upstream()?.exchange_code(code).await?)
    }

    /// Verify an upstream identity token and mint a session access token.
    pub async fn exchange_token(&self, raw_id_token: &str) -> Result<TokenSet, ExchangeError> {
        let signer = self.signer()?;
        let mut claims = self.upstream()?.verify_id_token(raw_id_token).await?;

        // Upstream flow claims describe the provider's client, not ours
        for name in [CLAIM_AZP, CLAIM_SCOPE, CLAIM_GRANT_TYPE] {
            claims.remove(name);
        }

        let subject = claims
            .subject()
            .ok_or(AuthError::MissingSubject)?
            .to_string();
        if let Some(provider) = &self.provider {
            if let Some(identity) = provider.resolve_roles_and_entitlements(&subject).await? {
                claims.append_strings(CLAIM_ROLES, identity.roles);
                claims.append_strings(CLAIM_ENTITLEMENTS, identity.entitlements);
            }
        }
        claims.insert(CLAIM_AUTH_METHOD, AUTH_METHOD_OIDC);

        let access_token = signer.sign(&claims)?;
        info!(subject = %subject, auth_method = AUTH_METHOD_OIDC, "Issued session token");

        Ok(TokenSet {
            access_token,
            id_token: None,
            expires_in: signer.settings().ttl_seconds,
            scope: None,
        })
    }

    // ---- Local login ----

    /// Verify a username and password and mint scope-filtered tokens.
    ///
    /// An identity token is issued only when `openid` is granted and a
    /// client id is given; its audience is that client.
    pub async fn login_local(
        &self,
        username: &str,
        password: &str,
        requested_scope: &str,
        client_id: Option<&str>,
        auth_method: &str,
    ) -> Result<TokenSet, ExchangeError> {
        let signer = self.signer()?;
        let provider = self.provider()?;
        let client_id = client_id.filter(|id| !id.is_empty());

        let requested = split_scope(requested_scope);
        if let Some(client_id) = client_id {
            let client = self.client_for_grant(client_id, GRANT_PASSWORD)?;
            check_scopes(client, &requested, true)?;
        }

        let identity = provider
            .verify_credentials(username, password)
            .await?
            .ok_or(ExchangeError::InvalidCredentials)?;

        let granted = grant_user_scopes(&requested, &identity.entitlements);
        self.issue_user_tokens(signer, &identity, &granted, client_id, auth_method)
    }

    // ---- Client credentials ----

    /// Authenticate a registered client by id and secret.
    pub fn authenticate_client(
        &self,
        client_id: &str,
        secret: Option<&str>,
    ) -> Result<&AuthClient, ExchangeError> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| ExchangeError::UnknownClient(client_id.to_string()))?;
        if !client.verify_secret(secret) {
            return Err(ExchangeError::InvalidClient(client_id.to_string()));
        }
        Ok(client)
    }

    /// Machine-to-machine grant. Only scopes covered by the client's
    /// allow-list are granted; an empty request gets the whole allow-list.
    pub async fn login_client(
        &self,
        client_id: &str,
        client_secret: &str,
        requested_scope: &str,
    ) -> Result<TokenSet, ExchangeError> {
        let signer = self.signer()?;
        if self.clients.is_empty() {
            return Err(ExchangeError::NotConfigured("client registry"));
        }

        let client = self.authenticate_client(client_id, Some(client_secret))?;
        if client.is_public() {
            return Err(ExchangeError::InvalidClient(client_id.to_string()));
        }
        if !client.allows_grant(GRANT_CLIENT_CREDENTIALS) {
            return Err(ExchangeError::UnauthorizedClient {
                client_id: client_id.to_string(),
                grant_type: GRANT_CLIENT_CREDENTIALS,
            });
        }

        let mut requested = split_scope(requested_scope);
        if requested.is_empty() {
            requested = client.allowed_scopes.clone();
        }
        check_scopes(client, &requested, false)?;

        let mut context = ClaimSet::new();
        context.insert(CLAIM_SUBJECT, client_id);
        context.insert(CLAIM_AZP, client_id);
        context.insert(CLAIM_AUTH_METHOD, AUTH_METHOD_CLIENT_SECRET);
        context.insert(CLAIM_GRANT_TYPE, GRANT_CLIENT_CREDENTIALS);
        let scope = (!requested.is_empty()).then(|| requested.join(" "));
        if let Some(scope) = &scope {
            context.insert(CLAIM_SCOPE, scope.as_str());
        }

        let access_token = signer.sign(&context)?;
        info!(
            client_id = %client_id,
            scope = scope.as_deref().unwrap_or_default(),
            "Issued client credentials token"
        );

        Ok(TokenSet {
            access_token,
            id_token: None,
            expires_in: signer.settings().ttl_seconds,
            scope,
        })
    }

    // ---- Authorization code ----

    /// Check an authorize request before a code is created.
    ///
    /// Failures here must not redirect: the redirect URI is not trusted yet.
    pub fn validate_authorization_request(
        &self,
        client_id: &str,
        redirect_uri: &str,
        requested_scope: &str,
        code_challenge: Option<&str>,
        code_challenge_method: Option<&str>,
    ) -> Result<&AuthClient, ExchangeError> {
        let client = self.client_for_grant(client_id, GRANT_AUTHORIZATION_CODE)?;
        if !client.has_redirect_uri(redirect_uri) {
            return Err(ExchangeError::UnregisteredRedirect(redirect_uri.to_string()));
        }
        check_scopes(client, &split_scope(requested_scope), true)?;

        match code_challenge.filter(|c| !c.is_empty()) {
            Some(_) => {
                pkce::normalize_method(code_challenge_method)?;
            }
            None if client.requires_pkce() => {
                return Err(ExchangeError::PkceRequired(client_id.to_string()));
            }
            None => {}
        }
        Ok(client)
    }

    /// Encode a new authorization code, defaulting its expiry.
    pub fn create_authorization_code(
        &self,
        mut claims: AuthorizationCodeClaims,
    ) -> Result<String, ExchangeError> {
        if claims.exp == 0 {
            claims.exp = Utc::now().timestamp() + DEFAULT_CODE_TTL_SECONDS;
        }
        self.codec
            .encode(&claims)
            .map_err(ExchangeError::CodeEncoding)
    }

    /// Redeem a code once, re-resolving the subject before issuing tokens.
    pub async fn redeem_authorization_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenSet, ExchangeError> {
        let signer = self.signer()?;
        let claims = self.codec.decode(code)?;

        if claims.client_id != client_id {
            return Err(ExchangeError::ClientMismatch);
        }
        if claims.redirect_uri != redirect_uri {
            return Err(ExchangeError::RedirectMismatch);
        }
        let client = self.client_for_grant(client_id, GRANT_AUTHORIZATION_CODE)?;

        match claims.code_challenge.as_deref().filter(|c| !c.is_empty()) {
            Some(challenge) => pkce::verify(
                challenge,
                claims.code_challenge_method.as_deref(),
                code_verifier,
            )?,
            None if client.requires_pkce() => {
                return Err(ExchangeError::PkceRequired(client_id.to_string()));
            }
            None => {}
        }

        let requested = split_scope(&claims.scope);
        check_scopes(client, &requested, true)?;

        if !self.redeemed.consume(code, claims.exp) {
            return Err(ExchangeError::CodeReused);
        }

        let identity = match &self.provider {
            Some(provider) => provider
                .resolve_roles_and_entitlements(&claims.subject)
                .await?
                .ok_or_else(|| ExchangeError::UnknownSubject(claims.subject.clone()))?,
            None => Identity {
                subject: claims.subject.clone(),
                ..Identity::default()
            },
        };

        let granted = grant_user_scopes(&requested, &identity.entitlements);
        self.issue_user_tokens(
            signer,
            &identity,
            &granted,
            Some(client_id),
            &claims.auth_method,
        )
    }

    // ---- Shared ----

    fn client_for_grant(
        &self,
        client_id: &str,
        grant_type: &'static str,
    ) -> Result<&AuthClient, ExchangeError> {
        let client = self
            .clients
            .get(client_id)
            .ok_or_else(|| ExchangeError::UnknownClient(client_id.to_string()))?;
        if !client.allows_grant(grant_type) {
            return Err(ExchangeError::UnauthorizedClient {
                client_id: client_id.to_string(),
                grant_type,
            });
        }
        Ok(client)
    }

    fn issue_user_tokens(
        &self,
        signer: &Signer,
        identity: &Identity,
        granted: &[String],
        client_id: Option<&str>,
        auth_method: &str,
    ) -> Result<TokenSet, ExchangeError> {
        let mut context = scoped_context(identity, granted);
        if !auth_method.is_empty() {
            context.insert(CLAIM_AUTH_METHOD, auth_method);
        }
        if let Some(client_id) = client_id {
            context.insert(CLAIM_AZP, client_id);
        }

        let access_token = signer.sign(&context)?;

        let id_token = match client_id {
            Some(client_id) if granted.iter().any(|s| s == SCOPE_OPENID) => {
                let mut id_context = context.clone();
                id_context.remove(CLAIM_SCOPE);
                Some(signer.sign_for(&id_context, client_id)?)
            }
            _ => None,
        };

        let scope = (!granted.is_empty()).then(|| granted.join(" "));
        info!(
            subject = %identity.subject,
            client_id = client_id.unwrap_or_default(),
            auth_method = %auth_method,
            id_token = id_token.is_some(),
            "Issued user tokens"
        );

        Ok(TokenSet {
            access_token,
            id_token,
            expires_in: signer.settings().ttl_seconds,
            scope,
        })
    }
}

impl std::fmt::Debug for Exchanger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchanger")
            .field("auth_enabled", &self.is_auth_enabled())
            .field("local_login", &self.has_local_login())
            .field("oidc", &self.oidc)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

fn check_scopes(
    client: &AuthClient,
    requested: &[String],
    user_flow: bool,
) -> Result<(), ExchangeError> {
    match client.first_forbidden_scope(requested, user_flow) {
        Some(scope) => Err(ExchangeError::InvalidScope {
            client_id: client.client_id.clone(),
            scope: scope.to_string(),
        }),
        None => Ok(()),
    }
}

/// Identity scopes are granted as requested; resource scopes only when the
/// user's entitlements cover them.
fn grant_user_scopes(requested: &[String], entitlements: &[String]) -> Vec<String> {
    let mut granted: Vec<String> = Vec::with_capacity(requested.len());
    for scope in requested {
        let allowed = IDENTITY_SCOPES.contains(&scope.as_str())
            || entitlements::has_scope(entitlements, scope);
        if allowed && !granted.contains(scope) {
            granted.push(scope.clone());
        }
    }
    granted
}

/// Signing context holding only what the granted scopes reveal.
fn scoped_context(identity: &Identity, granted: &[String]) -> ClaimSet {
    let has = |scope: &str| granted.iter().any(|s| s == scope);
    let mut context = ClaimSet::new();

    if has(SCOPE_PROFILE) {
        for (name, value) in identity.profile.iter() {
            if !REGISTERED_CLAIMS.contains(&name.as_str())
                && !PASSTHROUGH_CLAIMS.contains(&name.as_str())
            {
                context.insert(name.as_str(), value.clone());
            }
        }
    }
    if has(SCOPE_EMAIL) {
        if let Some(email) = &identity.email {
            context.insert(CLAIM_EMAIL, email.as_str());
        }
    }
    if has(SCOPE_ROLES) {
        context.insert(CLAIM_ROLES, identity.roles.clone());
    }
    if has(SCOPE_ENTITLEMENTS) {
        context.insert(CLAIM_ENTITLEMENTS, identity.entitlements.clone());
    }
    if !granted.is_empty() {
        context.insert(CLAIM_SCOPE, granted.join(" "));
    }
    context.insert(CLAIM_SUBJECT, identity.subject.as_str());
    context
}
