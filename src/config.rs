// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! Settings are read once at startup from environment variables. Empty
//! values count as unset.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `PUBLIC_URL` | Issuer and base URL of published endpoints | `http://localhost:8080` |
//! | `TOKEN_AUDIENCE` | Audience of access tokens | `PUBLIC_URL` |
//! | `TOKEN_TTL_SECONDS` | Token lifetime | `3600` |
//! | `SIGNING_KEYS` | `kid=/path.pem` or `/path.pem`, comma separated | none |
//! | `SIGNING_KEY_ACTIVE` | Active key id | none |
//! | `DEV_MODE` | Generate an ephemeral key when none configured | `false` |
//! | `AUTH_CODE_SECRET` | Authorization code and OIDC state secret | random per process |
//! | `CLIENTS_FILE` | OAuth2 client registrations (JSON) | none |
//! | `IDENTITIES_FILE` | Local identity store (JSON) | none |
//! | `CLAIM_RULES_FILE` | Claim mapping rules (JSON) | none |
//! | `OIDC_ISSUER_URL` | Upstream OIDC issuer | none |
//! | `OIDC_CLIENT_ID` / `OIDC_CLIENT_SECRET` | Upstream client credentials | required with issuer |
//! | `OIDC_REDIRECT_URL` | Upstream callback | `PUBLIC_URL/auth/oidc/callback` |
//! | `OIDC_SCOPES` | Upstream scopes (space separated) | `openid email profile` |
//! | `AUTH_COOKIE_NAME` | Session cookie name | `auth_token` |
//! | `LOGIN_PATH` | Login page for the authorize endpoint | `/login` |
//! | `TLS_CERT_PATH` / `TLS_KEY_PATH` | PEM certificate chain and key | plain HTTP |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::path::{Path, PathBuf};

use crate::auth::keys::{KeySecret, KeySettings, KeySource};
use crate::auth::oidc::OidcSettings;
use crate::auth::signer::TokenSettings;

pub const HOST_ENV: &str = "HOST";
pub const PORT_ENV: &str = "PORT";
pub const PUBLIC_URL_ENV: &str = "PUBLIC_URL";
pub const TOKEN_AUDIENCE_ENV: &str = "TOKEN_AUDIENCE";
pub const TOKEN_TTL_ENV: &str = "TOKEN_TTL_SECONDS";
pub const SIGNING_KEYS_ENV: &str = "SIGNING_KEYS";
pub const SIGNING_KEY_ACTIVE_ENV: &str = "SIGNING_KEY_ACTIVE";
pub const DEV_MODE_ENV: &str = "DEV_MODE";
pub const AUTH_CODE_SECRET_ENV: &str = "AUTH_CODE_SECRET";
pub const CLIENTS_FILE_ENV: &str = "CLIENTS_FILE";
pub const IDENTITIES_FILE_ENV: &str = "IDENTITIES_FILE";
pub const CLAIM_RULES_FILE_ENV: &str = "CLAIM_RULES_FILE";
pub const OIDC_ISSUER_URL_ENV: &str = "OIDC_ISSUER_URL";
pub const OIDC_CLIENT_ID_ENV: &str = "OIDC_CLIENT_ID";
pub const OIDC_CLIENT_SECRET_ENV: &str = "OIDC_CLIENT_SECRET";
pub const OIDC_REDIRECT_URL_ENV: &str = "OIDC_REDIRECT_URL";
pub const OIDC_SCOPES_ENV: &str = "OIDC_SCOPES";
pub const AUTH_COOKIE_NAME_ENV: &str = "AUTH_COOKIE_NAME";
pub const LOGIN_PATH_ENV: &str = "LOGIN_PATH";
pub const TLS_CERT_PATH_ENV: &str = "TLS_CERT_PATH";
pub const TLS_KEY_PATH_ENV: &str = "TLS_KEY_PATH";
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_PUBLIC_URL: &str = "http://localhost:8080";
pub const DEFAULT_TOKEN_TTL_SECONDS: i64 = 3600;
pub const DEFAULT_OIDC_SCOPES: &str = "openid email profile";
pub const DEFAULT_COOKIE_NAME: &str = "auth_token";
pub const DEFAULT_LOGIN_PATH: &str = "/login";

/// Path of the upstream OIDC callback route.
pub const OIDC_CALLBACK_PATH: &str = "/auth/oidc/callback";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{var} is required when {because} is set")]
    Missing {
        var: &'static str,
        because: &'static str,
    },

    #[error("{var} must be set together with {other}")]
    Unpaired {
        var: &'static str,
        other: &'static str,
    },

    #[error("invalid signing key entry {0:?}")]
    InvalidKeyEntry(String),
}

/// TLS certificate and key paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Everything read from the environment.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub public_url: String,
    pub token_audience: String,
    pub token_ttl_seconds: i64,
    pub signing_keys: Vec<KeySecret>,
    pub signing_key_active: Option<String>,
    pub dev_mode: bool,
    pub auth_code_secret: Option<String>,
    pub clients_file: Option<PathBuf>,
    pub identities_file: Option<PathBuf>,
    pub claim_rules_file: Option<PathBuf>,
    pub oidc: Option<OidcSettings>,
    pub cookie_name: String,
    pub login_path: String,
    pub tls: Option<TlsSettings>,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let port = match get(PORT_ENV) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                var: PORT_ENV,
                expected: "a port number",
                value,
            })?,
            None => DEFAULT_PORT,
        };

        let token_ttl_seconds = match get(TOKEN_TTL_ENV) {
            Some(value) => match value.parse::<i64>() {
                Ok(ttl) if ttl > 0 => ttl,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: TOKEN_TTL_ENV,
                        expected: "a positive number of seconds",
                        value,
                    })
                }
            },
            None => DEFAULT_TOKEN_TTL_SECONDS,
        };

        let dev_mode = match get(DEV_MODE_ENV) {
            Some(value) => parse_bool(&value).ok_or(ConfigError::Invalid {
                var: DEV_MODE_ENV,
                expected: "true or false",
                value,
            })?,
            None => false,
        };

        let public_url = get(PUBLIC_URL_ENV)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_PUBLIC_URL.to_string());

        let signing_keys = match get(SIGNING_KEYS_ENV) {
            Some(value) => parse_key_entries(&value)?,
            None => Vec::new(),
        };

        let oidc = match get(OIDC_ISSUER_URL_ENV) {
            Some(issuer_url) => Some(OidcSettings {
                issuer_url,
                client_id: get(OIDC_CLIENT_ID_ENV).ok_or(ConfigError::Missing {
                    var: OIDC_CLIENT_ID_ENV,
                    because: OIDC_ISSUER_URL_ENV,
                })?,
                client_secret: get(OIDC_CLIENT_SECRET_ENV).ok_or(ConfigError::Missing {
                    var: OIDC_CLIENT_SECRET_ENV,
                    because: OIDC_ISSUER_URL_ENV,
                })?,
                redirect_url: get(OIDC_REDIRECT_URL_ENV)
                    .unwrap_or_else(|| format!("{public_url}{OIDC_CALLBACK_PATH}")),
                scopes: get(OIDC_SCOPES_ENV)
                    .as_deref()
                    .unwrap_or(DEFAULT_OIDC_SCOPES)
                    .split_whitespace()
                    .map(str::to_string)
                    .collect(),
            }),
            None => None,
        };

        let tls = match (get(TLS_CERT_PATH_ENV), get(TLS_KEY_PATH_ENV)) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert_path: cert.into(),
                key_path: key.into(),
            }),
            (None, None) => None,
            (Some(_), None) => {
                return Err(ConfigError::Unpaired {
                    var: TLS_CERT_PATH_ENV,
                    other: TLS_KEY_PATH_ENV,
                })
            }
            (None, Some(_)) => {
                return Err(ConfigError::Unpaired {
                    var: TLS_KEY_PATH_ENV,
                    other: TLS_CERT_PATH_ENV,
                })
            }
        };

        Ok(Self {
            host: get(HOST_ENV).unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port,
            token_audience: get(TOKEN_AUDIENCE_ENV).unwrap_or_else(|| public_url.clone()),
            public_url,
            token_ttl_seconds,
            signing_keys,
            signing_key_active: get(SIGNING_KEY_ACTIVE_ENV),
            dev_mode,
            auth_code_secret: get(AUTH_CODE_SECRET_ENV),
            clients_file: get(CLIENTS_FILE_ENV).map(PathBuf::from),
            identities_file: get(IDENTITIES_FILE_ENV).map(PathBuf::from),
            claim_rules_file: get(CLAIM_RULES_FILE_ENV).map(PathBuf::from),
            oidc,
            cookie_name: get(AUTH_COOKIE_NAME_ENV)
                .unwrap_or_else(|| DEFAULT_COOKIE_NAME.to_string()),
            login_path: get(LOGIN_PATH_ENV).unwrap_or_else(|| DEFAULT_LOGIN_PATH.to_string()),
            tls,
        })
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn key_settings(&self) -> KeySettings {
        KeySettings {
            secrets: self.signing_keys.clone(),
            active_key: self.signing_key_active.clone(),
            dev_mode: self.dev_mode,
        }
    }

    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            issuer: self.public_url.clone(),
            audience: self.token_audience.clone(),
            ttl_seconds: self.token_ttl_seconds,
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `kid=/path/key.pem` or `/path/key.pem`, where the key id is the file stem.
fn parse_key_entries(value: &str) -> Result<Vec<KeySecret>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (key_id, path) = match entry.split_once('=') {
                Some((key_id, path)) => (key_id.trim().to_string(), PathBuf::from(path.trim())),
                None => {
                    let path = PathBuf::from(entry);
                    let stem = Path::new(entry)
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .unwrap_or_default()
                        .to_string();
                    (stem, path)
                }
            };
            if key_id.is_empty() || path.as_os_str().is_empty() {
                return Err(ConfigError::InvalidKeyEntry(entry.to_string()));
            }
            Ok(KeySecret {
                key_id,
                source: KeySource::File(path),
            })
        })
        .collect()
}
