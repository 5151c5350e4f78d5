// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Platform Identity - token, credential exchange and entitlement engine
//!
//! Mints and verifies signed access and identity tokens for a multi-tenant
//! host platform, drives the login and OAuth2 flows that produce them, and
//! decides whether a caller's granted scopes satisfy a resource's declared
//! security requirements.
//!
//! ## Modules
//!
//! - `api` - HTTP handlers (Axum): discovery, OAuth2 endpoints, browser sessions
//! - `auth` - Keys, signing, verification, exchange flows and entitlements
//! - `config` - Environment configuration
//! - `state` - Shared application state

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod state;

#[cfg(test)]
pub(crate) mod testutil;
