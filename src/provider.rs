//! Cloud provider action client.
//!
//! Asks the provider to resume or pause a VM. A `true` result only means the
//! provider accepted the request; whether the VM actually came up is
//! confirmed separately through the readiness probe. No retries happen here.

use crate::config::ProviderConfig;
use crate::types::VmAction;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::{error, info, warn};

/// Errors from building a provider client
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider setting {0} is not configured")]
    MissingSetting(&'static str),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Triggers lifecycle actions on provider-managed VMs.
#[async_trait]
pub trait VmActionClient: Send + Sync {
    /// Returns `true` iff the provider accepted the action request.
    async fn trigger(&self, vm_id: &str, action: VmAction) -> bool;
}

/// HTTP client for the provider's `/{id}/actions/{verb}/` endpoint.
pub struct HttpActionClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
    csrf_token: String,
}

impl HttpActionClient {
    pub fn new(
        base_url: &str,
        auth_token: &str,
        csrf_token: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let base_url = required("api_url", base_url)?;
        let auth_token = required("api_token", auth_token)?;
        let csrf_token = required("csrf_token", csrf_token)?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            csrf_token: csrf_token.to_string(),
        })
    }

    /// Build from config, filling unset credentials from the environment.
    pub fn from_config(config: &ProviderConfig) -> Result<Self, ProviderError> {
        let resolved = config.resolved();
        Self::new(
            resolved.api_url.as_deref().unwrap_or_default(),
            resolved.api_token.as_deref().unwrap_or_default(),
            resolved.csrf_token.as_deref().unwrap_or_default(),
            Duration::from_secs(resolved.request_timeout_secs),
        )
    }

    fn action_url(&self, vm_id: &str, action: VmAction) -> String {
        format!(
            "{}/{}/actions/{}/",
            self.base_url,
            vm_id,
            action.provider_verb()
        )
    }
}

fn required<'a>(name: &'static str, value: &'a str) -> Result<&'a str, ProviderError> {
    let value = value.trim();
    if value.is_empty() {
        error!(setting = name, "Provider setting is missing");
        return Err(ProviderError::MissingSetting(name));
    }
    Ok(value)
}

#[async_trait]
impl VmActionClient for HttpActionClient {
    async fn trigger(&self, vm_id: &str, action: VmAction) -> bool {
        if vm_id.is_empty() {
            error!(action = %action, "VM id is required for a provider action");
            return false;
        }

        let url = self.action_url(vm_id, action);
        info!(vm = %vm_id, action = %action, url = %url, "Requesting provider action");

        let result = self
            .client
            .post(&url)
            .header(ACCEPT, "application/json;Compute")
            .header(AUTHORIZATION, &self.auth_token)
            .header(
                CONTENT_TYPE,
                format!("application/json;{}", action.provider_verb()),
            )
            .header("X-CSRFTOKEN", &self.csrf_token)
            .body("{}")
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(
                    vm = %vm_id,
                    action = %action,
                    status = response.status().as_u16(),
                    "Provider accepted action"
                );
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                warn!(
                    vm = %vm_id,
                    action = %action,
                    status = status.as_u16(),
                    body = %body,
                    "Provider rejected action"
                );
                false
            }
            Err(e) => {
                error!(vm = %vm_id, action = %action, error = %e, "Provider request failed");
                false
            }
        }
    }
}
