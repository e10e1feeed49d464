// ABOUTME: Remote provisioning backend creating dedicated cloud VMs (droplets) per lab instance
// ABOUTME: Boots the lab container via a generated user-data script and opens its firewall ports

use super::{
    BackendError, BackendKind, ListFilter, ProviderHandle, ProvisionSpec, ProvisioningBackend,
    Result, RuntimeInfo, RuntimeState,
};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct CloudBackendConfig {
    pub api_base: String,
    pub api_token: String,
    pub region: String,
    pub size: String,
    /// Base image that ships with a container engine preinstalled; the
    /// boot script still installs one if it is missing.
    pub base_image: String,
    /// Tag applied to every VM this backend manages.
    pub tag: String,
    pub ssh_keys: Vec<String>,
    /// Settling time after the provider reports the VM active. "Active"
    /// only means the VM booted, not that the boot script has finished.
    pub boot_grace: Duration,
    pub request_timeout: Duration,
    /// Best-effort hourly price for the configured size. Informational.
    pub price_per_hour: Option<f64>,
}

impl Default for CloudBackendConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.digitalocean.com/v2".to_string(),
            api_token: String::new(),
            region: "fra1".to_string(),
            size: "s-1vcpu-1gb".to_string(),
            base_image: "docker-20-04".to_string(),
            tag: "rangelab".to_string(),
            ssh_keys: vec![],
            boot_grace: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
            price_per_hour: Some(0.00893),
        }
    }
}

#[derive(Debug)]
pub struct CloudVmBackend {
    client: Client,
    config: CloudBackendConfig,
}

#[derive(Debug, Serialize)]
struct CreateDropletRequest {
    name: String,
    region: String,
    size: String,
    image: String,
    user_data: String,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_keys: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Debug, Deserialize)]
struct DropletListEnvelope {
    #[serde(default)]
    droplets: Vec<Droplet>,
}

#[derive(Debug, Deserialize)]
struct Droplet {
    id: u64,
    status: String,
    #[serde(default)]
    networks: DropletNetworks,
}

#[derive(Debug, Deserialize, Default)]
struct DropletNetworks {
    #[serde(default)]
    v4: Vec<NetworkV4>,
}

#[derive(Debug, Deserialize)]
struct NetworkV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl CloudVmBackend {
    pub fn new(config: CloudBackendConfig) -> Result<Self> {
        if config.api_token.is_empty() {
            return Err(BackendError::Config(
                "cloud API token is required".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| BackendError::Config(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    /// User-data script the VM runs on first boot: make sure the engine
    /// exists, open the lab's ports, then run the lab container bound to
    /// all interfaces.
    fn boot_script(spec: &ProvisionSpec) -> String {
        let mut script = String::from(
            "#!/bin/bash\nset -euo pipefail\n\n\
             if ! command -v docker >/dev/null 2>&1; then\n\
             \x20\x20curl -fsSL https://get.docker.com | sh\nfi\n\n",
        );

        script.push_str("ufw allow 22/tcp\n");
        for port in &spec.container_ports {
            script.push_str(&format!("ufw allow {}/tcp\n", port));
        }
        script.push_str("ufw --force enable\n\n");

        script.push_str(&format!("docker pull {}\n", spec.image));

        script.push_str(&format!(
            "docker run -d --restart unless-stopped --name {}",
            spec.name
        ));
        script.push_str(&format!(" --memory {}", spec.memory_limit));
        script.push_str(&format!(" --cpus {}", spec.cpu_limit));
        for (key, value) in &spec.env_vars {
            script.push_str(&format!(" -e {}={}", key, value));
        }
        for port in &spec.container_ports {
            script.push_str(&format!(" -p 0.0.0.0:{}:{}", port, port));
        }
        script.push_str(&format!(" {}\n", spec.image));

        script
    }

    fn convert_status(status: &str) -> RuntimeState {
        match status {
            "new" => RuntimeState::Provisioning,
            "active" => RuntimeState::Running,
            "off" | "archive" => RuntimeState::Halted,
            other => RuntimeState::Failed(format!("unexpected droplet status: {}", other)),
        }
    }

    fn to_runtime_info(&self, droplet: Droplet) -> RuntimeInfo {
        let private_addr = droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "private")
            .map(|n| n.ip_address.clone());
        let public_addr = droplet
            .networks
            .v4
            .iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.clone());

        RuntimeInfo {
            resource_id: droplet.id.to_string(),
            state: Self::convert_status(&droplet.status),
            private_addr,
            public_addr,
            // Droplet VMs expose the lab's ports directly; there is no
            // host-side translation to report.
            ports: vec![],
            metadata: Some(serde_json::json!({
                "region": self.config.region,
                "size": self.config.size,
                "tag": self.config.tag,
                "price_per_hour": self.config.price_per_hour,
            })),
        }
    }

    async fn read_error_body(response: reqwest::Response) -> String {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        format!("{}: {}", status, body)
    }
}

#[async_trait]
impl ProvisioningBackend for CloudVmBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn readiness_grace(&self) -> Duration {
        self.config.boot_grace
    }

    async fn create(&self, spec: &ProvisionSpec) -> Result<ProviderHandle> {
        info!("Creating lab VM: {}", spec.name);

        let request = CreateDropletRequest {
            name: spec.name.clone(),
            region: self.config.region.clone(),
            size: self.config.size.clone(),
            image: self.config.base_image.clone(),
            user_data: Self::boot_script(spec),
            tags: vec![self.config.tag.clone(), spec.instance_id.clone()],
            ssh_keys: self.config.ssh_keys.clone(),
        };

        let response = self
            .client
            .post(self.url("/droplets"))
            .bearer_auth(&self.config.api_token)
            .json(&request)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Provisioning(
                Self::read_error_body(response).await,
            ));
        }

        let envelope: DropletEnvelope = response
            .json()
            .await
            .map_err(|e| BackendError::Provisioning(e.to_string()))?;

        debug!("Created VM {} for {}", envelope.droplet.id, spec.instance_id);

        Ok(ProviderHandle {
            kind: BackendKind::Remote,
            resource_id: envelope.droplet.id.to_string(),
        })
    }

    async fn inspect(&self, handle: &ProviderHandle) -> Result<RuntimeInfo> {
        let response = self
            .client
            .get(self.url(&format!("/droplets/{}", handle.resource_id)))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(RuntimeInfo {
                resource_id: handle.resource_id.clone(),
                state: RuntimeState::Missing,
                private_addr: None,
                public_addr: None,
                ports: vec![],
                metadata: None,
            });
        }

        if !response.status().is_success() {
            return Err(BackendError::Unreachable(
                Self::read_error_body(response).await,
            ));
        }

        let envelope: DropletEnvelope = response
            .json()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        Ok(self.to_runtime_info(envelope.droplet))
    }

    async fn reboot(&self, handle: &ProviderHandle) -> Result<()> {
        info!("Rebooting VM: {}", handle.resource_id);

        let response = self
            .client
            .post(self.url(&format!("/droplets/{}/actions", handle.resource_id)))
            .bearer_auth(&self.config.api_token)
            .json(&serde_json::json!({ "type": "reboot" }))
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Provisioning(
                Self::read_error_body(response).await,
            ));
        }
        Ok(())
    }

    async fn delete(&self, handle: &ProviderHandle) -> Result<()> {
        info!("Deleting VM: {}", handle.resource_id);

        let response = self
            .client
            .delete(self.url(&format!("/droplets/{}", handle.resource_id)))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND | StatusCode::GONE => {
                warn!("VM {} already gone", handle.resource_id);
                Ok(())
            }
            _ => Err(BackendError::Provisioning(
                Self::read_error_body(response).await,
            )),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeInfo>> {
        let response = self
            .client
            .get(self.url(&format!("/droplets?tag_name={}", self.config.tag)))
            .bearer_auth(&self.config.api_token)
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(BackendError::Unreachable(
                Self::read_error_body(response).await,
            ));
        }

        let envelope: DropletListEnvelope = response
            .json()
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        Ok(envelope
            .droplets
            .into_iter()
            .map(|d| self.to_runtime_info(d))
            .filter(|info| filter.include_halted || info.state != RuntimeState::Halted)
            .collect())
    }
}
