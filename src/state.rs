// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use crate::auth::AuthEngine;
use crate::config::Settings;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AuthEngine>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(engine: AuthEngine, settings: Settings) -> Self {
        Self {
            engine: Arc::new(engine),
            settings: Arc::new(settings),
        }
    }

    /// Whether the server itself terminates TLS.
    pub fn tls_enabled(&self) -> bool {
        self.settings.tls.is_some()
    }
}
