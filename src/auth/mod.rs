// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Identity and authorization engine: key lifecycle, token signing and
//! verification, credential exchange flows, and scope-based authorization.
//!
//! ## Auth Flow
//!
//! 1. A caller authenticates through one of the exchange flows:
//!    - upstream OIDC login (browser)
//!    - local username/password
//!    - OAuth2 client credentials
//!    - authorization code with PKCE
//! 2. [`signer::Signer`] mints a token with the active key
//! 3. On later requests the middleware:
//!    - verifies `Authorization: Bearer <token>` or the session cookie
//!    - attaches an [`AuthContext`] to the request
//! 4. Handlers check [`AuthContext::satisfies`] against the resource's
//!    declared security requirements
//!
//! ## Security
//!
//! - Tokens are pinned to the algorithm of the key named by `kid`
//! - Clock skew tolerance is 60 seconds
//! - Authorization codes are encrypted, short-lived and single use
//! - Client secrets and PKCE verifiers are compared in constant time

pub mod claims;
pub mod clients;
pub mod code;
pub mod cookie;
pub mod engine;
pub mod entitlements;
pub mod error;
pub mod exchange;
pub mod expr;
pub mod extractor;
pub mod jwks;
pub mod keys;
pub mod mapper;
pub mod middleware;
pub mod oidc;
pub mod pkce;
pub mod provider;
pub mod signer;
pub mod verifier;

pub use claims::{AuthContext, ClaimSet, ClaimValue, TokenSource};
pub use engine::{AuthEngine, EngineError};
pub use error::{AuthError, OAuthError};
pub use exchange::{ExchangeError, Exchanger, TokenSet};
pub use extractor::{Auth, OptionalAuth};
pub use jwks::JwksManager;
pub use keys::{KeyManager, KeyPair, KeyPairs};
pub use provider::{Identity, ScopeProvider};
pub use signer::Signer;
pub use verifier::TokenVerifier;
