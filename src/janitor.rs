//! Idempotent Docker container and network removal ahead of and after a
//! managed dependency's lifetime.

use bollard::container::RemoveContainerOptions;
use bollard::errors::Error as BollardError;
use bollard::network::ListNetworksOptions;
use bollard::Docker;
use log::{debug, warn};

use crate::error::StartupError;

pub struct ContainerJanitor {
    docker: Docker,
}

impl ContainerJanitor {
    pub fn new() -> Result<Self, StartupError> {
        let docker = Docker::connect_with_local_defaults().map_err(StartupError::ContainerEngine)?;
        Ok(Self { docker })
    }

    /// Force-removes a container by name. Absence is success: a 404 from
    /// the engine is treated as a no-op.
    pub async fn remove_container_if_exists(&self, name: &str) -> Result<(), StartupError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {
                debug!("removed container '{name}'");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!("container '{name}' already absent");
                Ok(())
            }
            Err(e) => Err(StartupError::ContainerEngine(e)),
        }
    }

    /// Removes a network by name, first listing networks and matching by
    /// name, since the engine's network removal takes an id-or-name but
    /// 404s inconsistently across engine versions for a name that was
    /// never created.
    pub async fn remove_network_if_exists(&self, name: &str) -> Result<(), StartupError> {
        let mut filters = std::collections::HashMap::new();
        filters.insert("name".to_string(), vec![name.to_string()]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await
            .map_err(StartupError::ContainerEngine)?;

        let exists = networks
            .iter()
            .any(|n| n.name.as_deref() == Some(name));
        if !exists {
            debug!("network '{name}' already absent");
            return Ok(());
        }

        match self.docker.remove_network(name).await {
            Ok(()) => {
                debug!("removed network '{name}'");
                Ok(())
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => {
                warn!("failed to remove network '{name}': {e}");
                Err(StartupError::ContainerEngine(e))
            }
        }
    }
}
