// ABOUTME: Local provisioning backend running lab containers on the host's Docker engine
// ABOUTME: Handles private networking, host port allocation, resource limits and image pulls

use super::{
    BackendError, BackendKind, ListFilter, PortMapping, ProviderHandle, ProvisionSpec,
    ProvisioningBackend, Result, RuntimeInfo, RuntimeState,
};
use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
        StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    network::{CreateNetworkOptions, ListNetworksOptions},
    Docker,
};
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct DockerBackendConfig {
    /// Dedicated private network all lab containers join.
    pub network: String,
    pub label_prefix: String,
    /// Inclusive host port range scanned for free ports.
    pub port_range: (u16, u16),
    pub pull_timeout: Duration,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            network: "rangelab".to_string(),
            label_prefix: "rangelab.instance".to_string(),
            port_range: (20000, 21000),
            pull_timeout: Duration::from_secs(600),
        }
    }
}

pub struct DockerBackend {
    client: Docker,
    config: DockerBackendConfig,
}

impl DockerBackend {
    pub fn new(config: DockerBackendConfig) -> Result<Self> {
        let client = Docker::connect_with_defaults()
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Create with a specific Docker connection (test use)
    pub fn with_client(client: Docker, config: DockerBackendConfig) -> Self {
        Self { client, config }
    }

    async fn ensure_network(&self) -> Result<()> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![self.config.network.clone()]);

        let networks = self
            .client
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        if networks
            .iter()
            .any(|n| n.name.as_deref() == Some(self.config.network.as_str()))
        {
            return Ok(());
        }

        info!("Creating lab network: {}", self.config.network);
        let options = CreateNetworkOptions {
            name: self.config.network.clone(),
            driver: "bridge".to_string(),
            ..Default::default()
        };

        match self.client.create_network(options).await {
            Ok(_) => Ok(()),
            // Another create raced us; the network existing is the goal.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(BackendError::Provisioning(e.to_string())),
        }
    }

    async fn managed_container_ids(&self, all: bool) -> Result<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}.managed=true", self.config.label_prefix)],
        );

        let containers = self
            .client
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| BackendError::Unreachable(e.to_string()))?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    /// Host ports currently bound by containers this backend manages.
    /// Scanned fresh on every allocation; never cached.
    async fn ports_in_use(&self) -> Result<HashSet<u16>> {
        let mut in_use = HashSet::new();
        for id in self.managed_container_ids(true).await? {
            let handle = ProviderHandle {
                kind: BackendKind::Local,
                resource_id: id,
            };
            match self.inspect(&handle).await {
                Ok(info) => in_use.extend(info.ports.iter().map(|m| m.host_port)),
                Err(e) => warn!("Skipping port scan of {}: {}", handle.resource_id, e),
            }
        }
        Ok(in_use)
    }

    async fn allocate_host_ports(&self, container_ports: &[u16]) -> Result<Vec<PortMapping>> {
        let in_use = self.ports_in_use().await?;
        let (start, end) = self.config.port_range;

        let mut allocated: Vec<PortMapping> = Vec::with_capacity(container_ports.len());
        let mut candidate = start;

        for &container_port in container_ports {
            loop {
                if candidate > end {
                    return Err(BackendError::Provisioning(format!(
                        "no free host port left in range {}-{}",
                        start, end
                    )));
                }
                let port = candidate;
                candidate += 1;

                if in_use.contains(&port) || allocated.iter().any(|m| m.host_port == port) {
                    continue;
                }
                // Bind probe catches ports taken by anything outside our
                // label scope.
                if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
                    allocated.push(PortMapping::tcp(container_port, port));
                    break;
                }
            }
        }

        debug!("Allocated host ports: {:?}", allocated);
        Ok(allocated)
    }

    fn to_container_config(
        &self,
        spec: &ProvisionSpec,
        mappings: &[PortMapping],
    ) -> Result<Config<String>> {
        let mut labels = HashMap::new();
        labels.insert(format!("{}.managed", self.config.label_prefix), "true".to_string());
        labels.insert(
            format!("{}.id", self.config.label_prefix),
            spec.instance_id.clone(),
        );

        let mut exposed_ports = HashMap::new();
        let mut port_bindings = HashMap::new();
        for mapping in mappings {
            let container_port = format!("{}/{}", mapping.container_port, mapping.protocol);
            exposed_ports.insert(container_port.clone(), HashMap::new());
            port_bindings.insert(
                container_port,
                Some(vec![bollard::models::PortBinding {
                    host_ip: Some("0.0.0.0".to_string()),
                    host_port: Some(mapping.host_port.to_string()),
                }]),
            );
        }

        let env: Vec<String> = spec
            .env_vars
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = bollard::models::HostConfig {
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: Some(parse_memory_limit(&spec.memory_limit)?),
            nano_cpus: Some(parse_cpu_limit(&spec.cpu_limit)?),
            network_mode: Some(self.config.network.clone()),
            ..Default::default()
        };

        Ok(Config {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(labels),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        })
    }

    fn convert_state(state: &str) -> RuntimeState {
        match state.to_lowercase().as_str() {
            "created" => RuntimeState::Provisioning,
            "running" | "restarting" => RuntimeState::Running,
            "paused" | "exited" | "removing" => RuntimeState::Halted,
            "dead" => RuntimeState::Failed("container is dead".to_string()),
            other => RuntimeState::Failed(format!("unknown container state: {}", other)),
        }
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.client.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(BackendError::Image(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        info!("Pulling image: {} (timeout: {:?})", image, self.config.pull_timeout);

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.create_image(Some(options), None, None);

        let pull = async {
            while let Some(result) = stream.next().await {
                let progress =
                    result.map_err(|e| BackendError::Image(format!("pull {}: {}", image, e)))?;
                if let Some(error) = progress.error {
                    return Err(BackendError::Image(format!("pull {}: {}", image, error)));
                }
            }
            Ok(())
        };

        match tokio::time::timeout(self.config.pull_timeout, pull).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Image(format!(
                "timeout pulling image {} after {:?}",
                image, self.config.pull_timeout
            ))),
        }
    }
}

#[async_trait]
impl ProvisioningBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn create(&self, spec: &ProvisionSpec) -> Result<ProviderHandle> {
        info!("Creating lab container: {}", spec.name);

        self.ensure_network().await?;

        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        let mappings = if spec.host_ports.is_empty() {
            self.allocate_host_ports(&spec.container_ports).await?
        } else {
            spec.host_ports.clone()
        };

        let config = self.to_container_config(spec, &mappings)?;
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let container = self
            .client
            .create_container(Some(options), config)
            .await
            .map_err(|e| BackendError::Provisioning(e.to_string()))?;

        debug!("Created container: {}", container.id);

        self.client
            .start_container(&container.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| BackendError::Provisioning(e.to_string()))?;

        Ok(ProviderHandle {
            kind: BackendKind::Local,
            resource_id: container.id,
        })
    }

    async fn inspect(&self, handle: &ProviderHandle) -> Result<RuntimeInfo> {
        let inspect = match self.client.inspect_container(&handle.resource_id, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Ok(RuntimeInfo {
                    resource_id: handle.resource_id.clone(),
                    state: RuntimeState::Missing,
                    private_addr: None,
                    public_addr: None,
                    ports: vec![],
                    metadata: None,
                })
            }
            Err(e) => return Err(BackendError::Unreachable(e.to_string())),
        };

        let state = inspect
            .state
            .as_ref()
            .and_then(|s| s.status.as_ref())
            .map(|s| Self::convert_state(s.as_ref()))
            .unwrap_or(RuntimeState::Failed("no state information".to_string()));

        let private_addr = inspect.network_settings.as_ref().and_then(|ns| {
            ns.networks
                .as_ref()
                .and_then(|networks| networks.get(&self.config.network))
                .and_then(|endpoint| endpoint.ip_address.clone())
                .filter(|ip| !ip.is_empty())
        });

        let mut ports = Vec::new();
        if let Some(port_map) = inspect
            .network_settings
            .as_ref()
            .and_then(|ns| ns.ports.as_ref())
        {
            for (container_port_str, bindings) in port_map {
                let Some(binding) = bindings.as_ref().and_then(|b| b.first()) else {
                    continue;
                };
                let mut parts = container_port_str.split('/');
                let (Some(port_num), protocol) = (parts.next(), parts.next().unwrap_or("tcp"))
                else {
                    continue;
                };
                if let (Ok(container_port), Some(Ok(host_port))) = (
                    port_num.parse::<u16>(),
                    binding.host_port.as_ref().map(|p| p.parse::<u16>()),
                ) {
                    ports.push(PortMapping {
                        container_port,
                        host_port,
                        protocol: protocol.to_string(),
                    });
                }
            }
        }

        Ok(RuntimeInfo {
            resource_id: handle.resource_id.clone(),
            state,
            private_addr,
            public_addr: None,
            ports,
            metadata: Some(serde_json::json!({
                "engine": "docker",
                "network": self.config.network,
            })),
        })
    }

    async fn reboot(&self, handle: &ProviderHandle) -> Result<()> {
        info!("Restarting container: {}", handle.resource_id);
        self.client
            .restart_container(&handle.resource_id, None)
            .await
            .map_err(|e| BackendError::Provisioning(e.to_string()))
    }

    async fn halt(&self, handle: &ProviderHandle) -> Result<()> {
        info!("Stopping container: {}", handle.resource_id);
        match self
            .client
            .stop_container(&handle.resource_id, Some(StopContainerOptions { t: 10 }))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped or already gone both leave us halted.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(e) => Err(BackendError::Provisioning(e.to_string())),
        }
    }

    async fn delete(&self, handle: &ProviderHandle) -> Result<()> {
        info!("Removing container: {}", handle.resource_id);
        match self
            .client
            .remove_container(
                &handle.resource_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                warn!("Container {} already gone", handle.resource_id);
                Ok(())
            }
            Err(e) => Err(BackendError::Provisioning(e.to_string())),
        }
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<RuntimeInfo>> {
        let mut infos = Vec::new();
        for id in self.managed_container_ids(filter.include_halted).await? {
            let handle = ProviderHandle {
                kind: BackendKind::Local,
                resource_id: id,
            };
            match self.inspect(&handle).await {
                Ok(info) if info.state != RuntimeState::Missing => infos.push(info),
                Ok(_) => {}
                Err(e) => warn!("Failed to inspect container {}: {}", handle.resource_id, e),
            }
        }
        Ok(infos)
    }
}

/// Translate a human-readable memory limit ("512m", "2g", raw bytes) into
/// engine-native bytes.
fn parse_memory_limit(limit: &str) -> Result<i64> {
    let trimmed = limit.trim().to_lowercase();
    if trimmed.is_empty() {
        return Err(BackendError::Config("empty memory limit".to_string()));
    }

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k') => (&trimmed[..trimmed.len() - 1], 1024i64),
        Some('m') => (&trimmed[..trimmed.len() - 1], 1024 * 1024),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * 1024 * 1024),
        _ => (trimmed.as_str(), 1),
    };

    let value: i64 = digits
        .parse()
        .map_err(|_| BackendError::Config(format!("invalid memory limit: {}", limit)))?;
    if value <= 0 {
        return Err(BackendError::Config(format!(
            "memory limit must be positive: {}",
            limit
        )));
    }

    Ok(value * multiplier)
}

/// Translate a fractional CPU count ("1.0", "0.5") into NanoCPUs.
fn parse_cpu_limit(limit: &str) -> Result<i64> {
    let cpus: f64 = limit
        .trim()
        .parse()
        .map_err(|_| BackendError::Config(format!("invalid cpu limit: {}", limit)))?;
    if !cpus.is_finite() || cpus <= 0.0 {
        return Err(BackendError::Config(format!(
            "cpu limit must be a finite positive number: {}",
            limit
        )));
    }
    Ok((cpus * 1_000_000_000.0) as i64)
}
