//! Inventory API client
//!
//! Two endpoints: fetch the authorized peer list for this relay and report
//! connected-key counts back. Every request carries the relay hostname
//! header; basic auth is attached when both credentials are configured.

use std::time::Duration;

use reqwest::{Client, RequestBuilder};
use serde::Serialize;

use super::peer::{ConnectedKeys, WireguardPeerList};
use crate::error::ApiError;

/// Connection settings for the inventory API
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub hostname: String,
    pub timeout: Duration,
}

/// HTTP client for the inventory API
pub struct ApiClient {
    config: ApiConfig,
    client: Client,
}

#[derive(Serialize)]
struct ConnectionReport<'a> {
    connections: &'a ConnectedKeys,
}

impl ApiClient {
    /// Build a client with the configured request timeout
    ///
    /// # Errors
    ///
    /// Returns `ApiError` if the underlying HTTP client cannot be built.
    pub fn new(config: ApiConfig) -> Result<Self, ApiError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    /// Fetch the list of authorized wireguard peers for this relay
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure, a non-2xx status, or a body
    /// that does not decode as a peer list. Callers treat any error the same
    /// way: leave the kernel untouched until the next attempt.
    pub async fn wireguard_peers(&self) -> Result<WireguardPeerList, ApiError> {
        let response = self
            .request(self.client.get(format!(
                "{}/internal/active-wireguard-peers/",
                self.config.base_url
            )))
            .send()
            .await?
            .error_for_status()?;

        response
            .json::<WireguardPeerList>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// Report the number of connections per connected key
    ///
    /// The response body is discarded.
    ///
    /// # Errors
    ///
    /// Returns `ApiError` on transport failure or a non-2xx status.
    pub async fn post_connections(&self, keys: &ConnectedKeys) -> Result<(), ApiError> {
        self.request(self.client.post(format!(
            "{}/internal/wireguard-connection-report/",
            self.config.base_url
        )))
        .json(&ConnectionReport { connections: keys })
        .send()
        .await?
        .error_for_status()?;

        Ok(())
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder
            .header("Content-Type", "application/json")
            .header("X-Relay-Hostname", &self.config.hostname);
        if self.config.username.is_empty() || self.config.password.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.config.username, Some(&self.config.password))
        }
    }
}
