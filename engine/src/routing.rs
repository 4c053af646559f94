//! Client for the external load-generator controller.
//!
//! The utilization server keeps a hostname routing table so that stress
//! containers survive a migration under a new pod identity. The engine only
//! needs two calls from it, captured here as a capability trait so tests can
//! mock the seam.
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parkour_common::load_profile::LoadProfile;
use unimock::unimock;

/// How long a controller call may take before it is treated as failed.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Define the behavior we consume from the load-generator controller.
#[unimock(api = RoutingClientMock)]
#[async_trait]
pub trait RoutingClient {
    /// Rename a workload hostname in the controller's routing table.
    async fn update_hostname(
        &self,
        endpoint: String,
        old_name: String,
        new_name: String,
    ) -> Result<()>;

    /// Fetch the synthetic load assigned to a hostname.
    async fn load_profile(&self, endpoint: String, hostname: String) -> Result<LoadProfile>;
}

/// HTTP implementation of [`RoutingClient`].
pub struct HttpRoutingClient {
    client: reqwest::Client,
}

impl HttpRoutingClient {
    /// Build a client with a bounded request timeout.
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?,
        })
    }
}

#[async_trait]
impl RoutingClient for HttpRoutingClient {
    async fn update_hostname(
        &self,
        endpoint: String,
        old_name: String,
        new_name: String,
    ) -> Result<()> {
        let url = format!("{endpoint}/hostname/update/{old_name}/{new_name}/");
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            bail!(
                "hostname update returned {}: {}",
                status,
                resp.text().await.unwrap_or_default()
            )
        }
        Ok(())
    }

    async fn load_profile(&self, endpoint: String, hostname: String) -> Result<LoadProfile> {
        let resp = self
            .client
            .get(format!("{endpoint}/metrics/{hostname}/"))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            bail!(
                "load profile fetch returned {}: {}",
                status,
                resp.text().await.unwrap_or_default()
            )
        }
        Ok(resp.json().await?)
    }
}
