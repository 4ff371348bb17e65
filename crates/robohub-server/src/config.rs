// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server-only configuration loaded from environment variables.

use std::net::SocketAddr;

use robohub_core::config::ConfigError;

/// HTTP surface configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP listen address.
    pub http_addr: SocketAddr,
    /// Bearer token for API routes. Unset leaves the API open (dev only).
    pub api_token: Option<String>,
    /// `x-deploy-token` credential for the CI publish route.
    pub deploy_token: Option<String>,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let port: u16 = std::env::var("ROBOHUB_HTTP_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("ROBOHUB_HTTP_PORT", "must be a valid port"))?;

        Ok(Self {
            http_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            api_token: non_empty(std::env::var("ROBOHUB_API_TOKEN").ok()),
            deploy_token: non_empty(std::env::var("DEPLOY_TOKEN").ok()),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
