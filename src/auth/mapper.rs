// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Declarative claim mapping.
//!
//! Each rule evaluates an expression against the signing context and writes
//! the result to a dotted target path in the outbound claims. Intermediate
//! maps are created as needed. A failing optional rule is skipped; a failing
//! required rule aborts the flow.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::claims::{ClaimSet, ClaimValue};
use super::expr::{ExprError, Program, Value};

/// A claim-mapping rule as configured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRule {
    /// Expression evaluated with the signing context bound to `claims`
    pub source: String,
    /// Dotted target path, e.g. `profile.address.street`
    pub target: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    #[error("claim rule for `{target}` does not compile: {error}")]
    Compile {
        target: String,
        #[source]
        error: ExprError,
    },

    #[error("invalid claim rule target `{0}`")]
    InvalidTarget(String),

    #[error("claim rule for `{target}` failed: {error}")]
    Evaluation {
        target: String,
        #[source]
        error: ExprError,
    },

    #[error("claim rule for `{target}` conflicts at `{segment}`, which holds a {found}")]
    PathConflict {
        target: String,
        segment: String,
        found: &'static str,
    },

    #[error("failed to read claim rules from {path}: {reason}")]
    Load { path: String, reason: String },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    program: Program,
    target: String,
    path: Vec<String>,
    required: bool,
}

/// Compiled claim-mapping rules.
#[derive(Debug, Clone, Default)]
pub struct ClaimMapper {
    rules: Vec<CompiledRule>,
}

impl ClaimMapper {
    /// Compile rules. Any invalid expression or target is an error.
    pub fn new(rules: Vec<ClaimRule>) -> Result<Self, MappingError> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let path: Vec<String> = rule.target.split('.').map(str::to_string).collect();
                if path.iter().any(String::is_empty) {
                    return Err(MappingError::InvalidTarget(rule.target));
                }
                let program =
                    Program::compile(&rule.source).map_err(|error| MappingError::Compile {
                        target: rule.target.clone(),
                        error,
                    })?;
                Ok(CompiledRule {
                    program,
                    target: rule.target,
                    path,
                    required: rule.required,
                })
            })
            .collect::<Result<_, _>>()?;

        Ok(Self { rules })
    }

    /// Read a JSON array of rules and compile it.
    pub fn from_file(path: &Path) -> Result<Self, MappingError> {
        let load_error = |reason: String| MappingError::Load {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        let rules: Vec<ClaimRule> =
            serde_json::from_str(&raw).map_err(|e| load_error(e.to_string()))?;
        Self::new(rules)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule to `source` and return the mapped claims.
    pub fn evaluate(&self, source: &ClaimSet) -> Result<ClaimSet, MappingError> {
        let root = Value::from_claims(source);
        let mut mapped = BTreeMap::new();

        for rule in &self.rules {
            let outcome = rule
                .program
                .evaluate(&root)
                .and_then(Value::into_claim)
                .map_err(|error| MappingError::Evaluation {
                    target: rule.target.clone(),
                    error,
                })
                .and_then(|value| assign(&mut mapped, rule, value));

            match outcome {
                Ok(()) => {}
                Err(err) if !rule.required => {
                    debug!(target_path = %rule.target, error = %err, "Skipping optional claim rule");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(ClaimSet::from(mapped))
    }
}

/// Write `value` at the rule's path, creating intermediate maps.
///
/// Conflicts can only be found on pre-existing values, which are all visited
/// before anything is created, so a failed assignment leaves `root` intact.
fn assign(
    root: &mut BTreeMap<String, ClaimValue>,
    rule: &CompiledRule,
    value: ClaimValue,
) -> Result<(), MappingError> {
    let Some((last, parents)) = rule.path.split_last() else {
        return Err(MappingError::InvalidTarget(rule.target.clone()));
    };

    let mut current = root;
    for segment in parents {
        let next = current
            .entry(segment.clone())
            .or_insert_with(|| ClaimValue::Map(BTreeMap::new()));
        current = match next {
            ClaimValue::Map(inner) => inner,
            other => {
                return Err(MappingError::PathConflict {
                    target: rule.target.clone(),
                    segment: segment.clone(),
                    found: other.kind(),
                })
            }
        };
    }

    current.insert(last.clone(), value);
    Ok(())
}
