// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Claim values, claim sets and the request-scoped authentication context.
//!
//! Claims flow between the upstream OIDC provider, the local identity store,
//! the claim mapper and the signer. They are modelled as a closed tagged union
//! so every consumer handles every shape explicitly.

use std::collections::BTreeMap;

use serde::{de::Error as _, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use super::entitlements::{self, SecurityRequirement};

/// Subject claim.
pub const CLAIM_SUBJECT: &str = "sub";
/// Email claim.
pub const CLAIM_EMAIL: &str = "email";
/// Role names resolved for the subject.
pub const CLAIM_ROLES: &str = "roles";
/// Entitlement scopes resolved for the subject.
pub const CLAIM_ENTITLEMENTS: &str = "entitlements";
/// Space-separated granted scope.
pub const CLAIM_SCOPE: &str = "scope";
/// How the subject authenticated (`password`, `oidc`, `client_secret`, ...).
pub const CLAIM_AUTH_METHOD: &str = "auth_method";
/// Authorized party (client the token was issued to).
pub const CLAIM_AZP: &str = "azp";
/// OAuth2 grant that produced the token.
pub const CLAIM_GRANT_TYPE: &str = "grant_type";

/// Claims controlled by the signer and never copied from a signing context.
pub const REGISTERED_CLAIMS: &[&str] = &["iss", "sub", "aud", "exp", "iat", "nbf", "jti"];

/// OIDC standard profile claims, released only when `profile` is granted.
pub const PROFILE_CLAIMS: &[&str] = &[
    "name",
    "given_name",
    "family_name",
    "middle_name",
    "nickname",
    "preferred_username",
    "profile",
    "picture",
    "website",
    "gender",
    "birthdate",
    "zoneinfo",
    "locale",
    "updated_at",
    "email_verified",
];

/// A single claim value.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimValue {
    String(String),
    Number(serde_json::Number),
    Bool(bool),
    List(Vec<String>),
    Map(BTreeMap<String, ClaimValue>),
}

impl ClaimValue {
    /// Convert a JSON value, dropping `null`s and stringifying scalar list items.
    pub fn from_json(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(ClaimValue::Bool(b)),
            Value::Number(n) => Some(ClaimValue::Number(n)),
            Value::String(s) => Some(ClaimValue::String(s)),
            Value::Array(items) => Some(ClaimValue::List(
                items
                    .into_iter()
                    .filter_map(|item| match item {
                        Value::String(s) => Some(s),
                        Value::Number(n) => Some(n.to_string()),
                        Value::Bool(b) => Some(b.to_string()),
                        _ => None,
                    })
                    .collect(),
            )),
            Value::Object(map) => Some(ClaimValue::Map(
                map.into_iter()
                    .filter_map(|(k, v)| ClaimValue::from_json(v).map(|v| (k, v)))
                    .collect(),
            )),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ClaimValue::String(s) => Value::String(s.clone()),
            ClaimValue::Number(n) => Value::Number(n.clone()),
            ClaimValue::Bool(b) => Value::Bool(*b),
            ClaimValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
            ClaimValue::Map(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ClaimValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ClaimValue>> {
        match self {
            ClaimValue::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ClaimValue::String(_) => "string",
            ClaimValue::Number(_) => "number",
            ClaimValue::Bool(_) => "bool",
            ClaimValue::List(_) => "list",
            ClaimValue::Map(_) => "map",
        }
    }
}

impl Serialize for ClaimValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClaimValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        ClaimValue::from_json(value).ok_or_else(|| D::Error::custom("claim value must not be null"))
    }
}

impl From<&str> for ClaimValue {
    fn from(value: &str) -> Self {
        ClaimValue::String(value.to_string())
    }
}

impl From<String> for ClaimValue {
    fn from(value: String) -> Self {
        ClaimValue::String(value)
    }
}

impl From<bool> for ClaimValue {
    fn from(value: bool) -> Self {
        ClaimValue::Bool(value)
    }
}

impl From<i64> for ClaimValue {
    fn from(value: i64) -> Self {
        ClaimValue::Number(value.into())
    }
}

impl From<Vec<String>> for ClaimValue {
    fn from(value: Vec<String>) -> Self {
        ClaimValue::List(value)
    }
}

impl From<BTreeMap<String, ClaimValue>> for ClaimValue {
    fn from(value: BTreeMap<String, ClaimValue>) -> Self {
        ClaimValue::Map(value)
    }
}

/// A string-keyed claim bag.
///
/// Used both as the signing context assembled by a flow and as the verified
/// claims of an inbound token.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClaimSet(BTreeMap<String, ClaimValue>);

impl ClaimSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a JSON object, skipping `null` members.
    pub fn from_json_object(object: Map<String, Value>) -> Self {
        Self(
            object
                .into_iter()
                .filter_map(|(k, v)| ClaimValue::from_json(v).map(|v| (k, v)))
                .collect(),
        )
    }

    pub fn to_json_object(&self) -> Map<String, Value> {
        self.0
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<&ClaimValue> {
        self.0.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut ClaimValue> {
        self.0.get_mut(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(ClaimValue::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ClaimValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<ClaimValue> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ClaimValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `sub` claim, if present and non-empty.
    pub fn subject(&self) -> Option<&str> {
        self.get_str(CLAIM_SUBJECT).filter(|s| !s.is_empty())
    }

    /// Read a claim that may be absent, a single string, or a list of strings.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(ClaimValue::String(s)) => vec![s.clone()],
            Some(ClaimValue::List(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Append values to a string or list claim without replacing what is there.
    ///
    /// Values already present are not duplicated. The result is always a list.
    pub fn append_strings<I>(&mut self, key: &str, values: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut merged = self.string_list(key);
        for value in values {
            if !merged.contains(&value) {
                merged.push(value);
            }
        }
        self.0.insert(key.to_string(), ClaimValue::List(merged));
    }

    /// Space-separated `scope` claim as individual scopes.
    pub fn scopes(&self) -> Vec<String> {
        self.get_str(CLAIM_SCOPE)
            .map(split_scope)
            .unwrap_or_default()
    }

    pub fn into_inner(self) -> BTreeMap<String, ClaimValue> {
        self.0
    }
}

impl From<BTreeMap<String, ClaimValue>> for ClaimSet {
    fn from(value: BTreeMap<String, ClaimValue>) -> Self {
        Self(value)
    }
}

impl Serialize for ClaimSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ClaimSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Map::<String, Value>::deserialize(deserializer)?;
        Ok(ClaimSet::from_json_object(object))
    }
}

/// Split a space-separated scope string.
pub fn split_scope(scope: &str) -> Vec<String> {
    scope.split_whitespace().map(str::to_string).collect()
}

/// Where the verified token was presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TokenSource {
    Header,
    Cookie,
}

/// Authentication context attached to a request by the middleware.
///
/// This is the primary type handlers use to learn who is calling. It is
/// built once per request from a verified token and never re-verified.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct AuthContext {
    /// Verified `sub` claim
    pub subject: String,

    /// All verified claims
    #[schema(value_type = Object)]
    pub claims: ClaimSet,

    /// Header or cookie
    pub source: TokenSource,

    /// Token expiry (Unix timestamp)
    #[serde(skip)]
    pub expires_at: i64,
}

impl AuthContext {
    /// Build from verified claims. Returns `None` when the subject is missing.
    pub fn from_claims(claims: ClaimSet, source: TokenSource) -> Option<Self> {
        let subject = claims.subject()?.to_string();
        let expires_at = match claims.get("exp") {
            Some(ClaimValue::Number(n)) => n.as_i64().unwrap_or_default(),
            _ => 0,
        };
        Some(Self {
            subject,
            claims,
            source,
            expires_at,
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.claims.get_str(CLAIM_EMAIL)
    }

    pub fn auth_method(&self) -> Option<&str> {
        self.claims.get_str(CLAIM_AUTH_METHOD)
    }

    pub fn roles(&self) -> Vec<String> {
        self.claims.string_list(CLAIM_ROLES)
    }

    /// Scopes held by the caller: the `scope` claim plus any entitlements.
    pub fn granted_scopes(&self) -> Vec<String> {
        let mut granted = self.claims.scopes();
        for entitlement in self.claims.string_list(CLAIM_ENTITLEMENTS) {
            if !granted.contains(&entitlement) {
                granted.push(entitlement);
            }
        }
        granted
    }

    /// Check the caller against a resource's declared security requirements.
    pub fn satisfies(&self, requirements: &[SecurityRequirement]) -> bool {
        entitlements::validate(requirements, &self.granted_scopes())
    }
}
