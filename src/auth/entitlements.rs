// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Entitlement evaluation.
//!
//! A resource declares a list of [`SecurityRequirement`]s. A caller is allowed
//! when it satisfies any one of them (OR across the list); satisfying one
//! requirement means holding every scope under every scheme (AND). An empty
//! list marks a public resource.
//!
//! ## Scope patterns
//!
//! Scopes are `resource[:resourceName]:verb`. The two-part form is shorthand
//! for `resource::verb`. An empty or `*` resource name on either side is a
//! wildcard, and a held verb of `all` matches any required verb.

use std::collections::BTreeMap;

/// Scheme name -> scopes required under that scheme.
pub type SecurityRequirement = BTreeMap<String, Vec<String>>;

/// Scheme the identity scope is injected under.
pub const IDENTITY_SCHEME: &str = "bearer";

const VERB_ALL: &str = "all";
const VERB_READ: &str = "read";

/// Decide whether `granted` satisfies `requirements`.
pub fn validate(requirements: &[SecurityRequirement], granted: &[String]) -> bool {
    if requirements.is_empty() {
        return true;
    }

    requirements.iter().any(|requirement| {
        requirement
            .values()
            .flatten()
            .all(|required| has_scope(granted, required))
    })
}

/// True if any granted scope matches `required`.
pub fn has_scope(granted: &[String], required: &str) -> bool {
    granted.iter().any(|held| scope_matches(held, required))
}

/// Match one held scope against one required scope.
pub fn scope_matches(granted: &str, required: &str) -> bool {
    if granted == required {
        return true;
    }

    let (Some(held), Some(wanted)) = (ScopeParts::parse(granted), ScopeParts::parse(required))
    else {
        return false;
    };

    if held.resource != wanted.resource {
        return false;
    }

    if held.verb != VERB_ALL && held.verb != wanted.verb {
        return false;
    }

    is_wildcard(held.name) || is_wildcard(wanted.name) || held.name == wanted.name
}

/// Add the `resource:name:read` identity scope to every requirement.
///
/// When no requirements are declared a single requirement holding only the
/// identity scope is produced, so the check is never vacuous.
pub fn with_identity_scope(
    requirements: &[SecurityRequirement],
    resource: &str,
    name: &str,
) -> Vec<SecurityRequirement> {
    let identity = format!("{resource}:{name}:{VERB_READ}");

    if requirements.is_empty() {
        let mut requirement = SecurityRequirement::new();
        requirement.insert(IDENTITY_SCHEME.to_string(), vec![identity]);
        return vec![requirement];
    }

    requirements
        .iter()
        .cloned()
        .map(|mut requirement| {
            requirement
                .entry(IDENTITY_SCHEME.to_string())
                .or_default()
                .push(identity.clone());
            requirement
        })
        .collect()
}

/// Resource-level read check: declared requirements plus read visibility on
/// the named instance.
pub fn validate_resource_read(
    requirements: &[SecurityRequirement],
    resource: &str,
    name: &str,
    granted: &[String],
) -> bool {
    validate(&with_identity_scope(requirements, resource, name), granted)
}

fn is_wildcard(name: &str) -> bool {
    name.is_empty() || name == "*"
}

struct ScopeParts<'a> {
    resource: &'a str,
    name: &'a str,
    verb: &'a str,
}

impl<'a> ScopeParts<'a> {
    fn parse(scope: &'a str) -> Option<Self> {
        let parts: Vec<&str> = scope.split(':').collect();
        match parts[..] {
            [resource, verb] => Some(Self {
                resource,
                name: "",
                verb,
            }),
            [resource, name, verb] => Some(Self {
                resource,
                name,
                verb,
            }),
            _ => None,
        }
    }
}
