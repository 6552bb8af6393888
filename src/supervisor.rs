//! The Supervisor: the crate's core orchestration point. Owns
//! working-directory resolution, starts managed dependencies and
//! services in order, and signals every long-running task to stop.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use uuid::Uuid;

use crate::config::{ConfigEntity, ConfigTree, ManagedDependency, ManagedDependencyKind, Service};
use crate::error::{ConfigError, StartupError, SubstrateError};
use crate::event_store::EventStore;
use crate::janitor::ContainerJanitor;
use crate::kafka_observer::{KafkaObserver, KafkaObserverHandle};
use crate::process::{ProcessConfig, ProcessHandle, ProcessRunner};
use crate::proxy::{CaptureProxy, ProxyHandle};
use crate::readiness::{HttpHealthProbe, KafkaMetadataProbe, PortFreeProbe, ReadinessWaiter};

const KAFKA_COMPOSE_TEMPLATE: &str = include_str!("templates/kafka-compose.yaml");
const LOCALSTACK_COMPOSE_TEMPLATE: &str = include_str!("templates/localstack-compose.yaml");

/// One entity the Supervisor is keeping alive.
enum ManagedEntity {
    Dependency {
        process: ProcessHandle,
        kafka_observer: Option<KafkaObserverHandle>,
    },
    Service {
        process: ProcessHandle,
        proxy: Option<ProxyHandle>,
    },
}

pub struct Supervisor {
    store: EventStore,
    working_directories: HashMap<String, PathBuf>,
    entities: Vec<ManagedEntity>,
    janitor: ContainerJanitor,
}

impl Supervisor {
    pub fn new(store: EventStore) -> Result<Self, StartupError> {
        Ok(Self {
            store,
            working_directories: HashMap::new(),
            entities: Vec::new(),
            janitor: ContainerJanitor::new()?,
        })
    }

    /// Gives access to the event store for wiring up a Broadcast Tailer.
    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    /// Records a canonical absolute working directory for `service_name`,
    /// resolved by upward search if `path` is relative. Fails if the same
    /// service name was registered before (the first mapping wins) or the
    /// resolved target is not a directory.
    pub fn add_working_directory(&mut self, service_name: &str, path: &str) -> Result<(), ConfigError> {
        if self.working_directories.contains_key(service_name) {
            return Err(ConfigError::DuplicateName(service_name.to_string()));
        }
        let resolved = resolve_upward(path)?;
        self.working_directories.insert(service_name.to_string(), resolved);
        Ok(())
    }

    /// Starts every managed dependency, then every service, in declaration order.
    pub async fn start(&mut self, config: &ConfigTree) -> Result<(), SubstrateError> {
        validate_names(config)?;

        for entity in config.entities_in_start_order() {
            match entity {
                ConfigEntity::ManagedDependency(dep) => self.start_dependency(dep).await?,
                ConfigEntity::Service(svc) => self.start_service(svc).await?,
            }
        }
        Ok(())
    }

    /// Signals every Process Runner's and Capture Proxy's stop channel,
    /// then closes the Event Store. Calling this twice on an otherwise
    /// idle Supervisor is safe: the second signal on each channel is
    /// logged and ignored.
    pub async fn stop(&mut self) -> Result<(), SubstrateError> {
        for entity in &self.entities {
            match entity {
                ManagedEntity::Dependency { process, kafka_observer } => {
                    process.stop.stop();
                    if let Some(observer) = kafka_observer {
                        observer.stop.stop();
                    }
                }
                ManagedEntity::Service { process, proxy } => {
                    process.stop.stop();
                    if let Some(proxy) = proxy {
                        proxy.stop.stop();
                    }
                }
            }
        }
        info!("supervisor stop signaled for {} entities", self.entities.len());
        self.store.close().await.map_err(SubstrateError::EventStore)?;
        Ok(())
    }

    async fn start_dependency(&mut self, dep: ManagedDependency) -> Result<(), SubstrateError> {
        match dep.kind {
            ManagedDependencyKind::Kafka { port } => {
                let manifest = KAFKA_COMPOSE_TEMPLATE.replace("{{kafka_port}}", &port.to_string());
                let working_dir = write_compose_manifest(&dep.name, &manifest).await?;

                self.janitor.remove_container_if_exists("broker").await?;
                self.janitor.remove_container_if_exists("kowl").await?;
                self.janitor.remove_network_if_exists(&format!("{}_default", dep.name)).await?;

                ReadinessWaiter::port_defaults()
                    .wait(PortFreeProbe::new(port))
                    .await
                    .map_err(|e| StartupError::ReadinessTimeout {
                        name: dep.name.clone(),
                        reason: e.to_string(),
                    })?;

                let process = ProcessRunner::spawn(
                    ProcessConfig {
                        name: dep.name.clone(),
                        working_directory: working_dir,
                        run_commands: vec!["docker compose up --no-color".to_string()],
                    },
                    self.store.clone(),
                )
                .await?;

                let broker = format!("localhost:{port}");
                let probe = KafkaMetadataProbe::new(&broker, Duration::from_secs(2))
                    .map_err(|e| StartupError::ReadinessTimeout {
                        name: dep.name.clone(),
                        reason: e.to_string(),
                    })?;
                ReadinessWaiter::managed_dependency_defaults()
                    .wait(probe)
                    .await
                    .map_err(|e| StartupError::ReadinessTimeout {
                        name: dep.name.clone(),
                        reason: e.to_string(),
                    })?;

                let kafka_observer = KafkaObserver::spawn(dep.name.clone(), broker, self.store.clone());

                self.entities.push(ManagedEntity::Dependency {
                    process,
                    kafka_observer: Some(kafka_observer),
                });
            }
            ManagedDependencyKind::LocalStack { port } => {
                let manifest = LOCALSTACK_COMPOSE_TEMPLATE.replace("{{localstack_port}}", &port.to_string());
                let working_dir = write_compose_manifest(&dep.name, &manifest).await?;

                self.janitor.remove_container_if_exists("localstack").await?;
                self.janitor.remove_network_if_exists(&format!("{}_default", dep.name)).await?;

                ReadinessWaiter::port_defaults()
                    .wait(PortFreeProbe::new(port))
                    .await
                    .map_err(|e| StartupError::ReadinessTimeout {
                        name: dep.name.clone(),
                        reason: e.to_string(),
                    })?;

                let process = ProcessRunner::spawn(
                    ProcessConfig {
                        name: dep.name.clone(),
                        working_directory: working_dir,
                        run_commands: vec!["docker compose up --no-color".to_string()],
                    },
                    self.store.clone(),
                )
                .await?;

                let health_url = format!("http://localhost:{port}/_localstack/health");
                ReadinessWaiter::managed_dependency_defaults()
                    .wait(HttpHealthProbe::new(health_url))
                    .await
                    .map_err(|e| StartupError::ReadinessTimeout {
                        name: dep.name.clone(),
                        reason: e.to_string(),
                    })?;

                self.entities.push(ManagedEntity::Dependency {
                    process,
                    kafka_observer: None,
                });
            }
        }
        Ok(())
    }

    async fn start_service(&mut self, svc: Service) -> Result<(), SubstrateError> {
        let working_directory = self.resolve_service_working_directory(&svc)?;

        let process = ProcessRunner::spawn(
            ProcessConfig {
                name: svc.name.clone(),
                working_directory,
                run_commands: svc.run_commands.clone(),
            },
            self.store.clone(),
        )
        .await?;

        let proxy = match (svc.service_port, svc.proxy_port) {
            (Some(service_port), Some(proxy_port)) => Some(
                CaptureProxy::spawn(svc.name.clone(), proxy_port, service_port, self.store.clone()).await?,
            ),
            _ => None,
        };

        self.entities.push(ManagedEntity::Service { process, proxy });
        Ok(())
    }

    fn resolve_service_working_directory(&self, svc: &Service) -> Result<PathBuf, ConfigError> {
        if let Some(registered) = self.working_directories.get(&svc.name) {
            return Ok(registered.clone());
        }
        match &svc.working_directory {
            Some(relative) => resolve_upward(relative),
            None => Ok(std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
        }
    }
}

/// Resolves `path`: absolute paths are stat'd directly; relative paths
/// are searched for in the current directory and then each ancestor in
/// turn, accepting the first hit.
fn resolve_upward(path: &str) -> Result<PathBuf, ConfigError> {
    let candidate = Path::new(path);
    if candidate.is_absolute() {
        return if candidate.is_dir() {
            Ok(candidate.to_path_buf())
        } else {
            Err(ConfigError::NotADirectory { path: candidate.to_path_buf() })
        };
    }

    let current_dir = std::env::current_dir().map_err(|_| ConfigError::WorkingDirectoryNotFound {
        relative: path.to_string(),
    })?;

    for ancestor in current_dir.ancestors() {
        let joined = ancestor.join(candidate);
        if joined.is_dir() {
            return Ok(joined);
        }
    }

    Err(ConfigError::WorkingDirectoryNotFound { relative: path.to_string() })
}

/// Validates names and ports across the whole tree before anything
/// starts: blank or duplicate names, and any declared port outside
/// `1..=65535` (a `0` in a `u16` field means "unset" nowhere in this
/// config's shape, so it can only mean a misconfigured port).
fn validate_names(config: &ConfigTree) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for entity in config.entities_in_start_order() {
        let name = match &entity {
            ConfigEntity::Service(s) => &s.name,
            ConfigEntity::ManagedDependency(d) => &d.name,
        };
        if name.trim().is_empty() {
            return Err(ConfigError::BlankName);
        }
        if !seen.insert(name.clone()) {
            return Err(ConfigError::DuplicateName(name.clone()));
        }

        match &entity {
            ConfigEntity::Service(s) => {
                check_port(s.service_port)?;
                check_port(s.proxy_port)?;
            }
            ConfigEntity::ManagedDependency(d) => match d.kind {
                ManagedDependencyKind::Kafka { port } | ManagedDependencyKind::LocalStack { port } => {
                    check_port(Some(port))?;
                }
            },
        }
    }
    Ok(())
}

fn check_port(port: Option<u16>) -> Result<(), ConfigError> {
    match port {
        Some(0) => Err(ConfigError::InvalidPort(0)),
        _ => Ok(()),
    }
}

async fn write_compose_manifest(entity_name: &str, manifest: &str) -> Result<PathBuf, StartupError> {
    let dir = std::env::temp_dir().join(format!("substrate-{entity_name}-{}", Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.map_err(StartupError::ComposeManifest)?;
    tokio::fs::write(dir.join("docker-compose.yaml"), manifest)
        .await
        .map_err(StartupError::ComposeManifest)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Service;

    #[tokio::test]
    async fn add_working_directory_rejects_duplicate_name() {
        let store = EventStore::open_in_memory().await.unwrap();
        let mut supervisor = Supervisor::new(store).unwrap();

        let tmp = tempfile::tempdir().unwrap();
        supervisor
            .add_working_directory("svc", tmp.path().to_str().unwrap())
            .unwrap();
        let err = supervisor
            .add_working_directory("svc", tmp.path().to_str().unwrap())
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateName(name) if name == "svc"));
    }

    #[tokio::test]
    async fn start_rejects_blank_service_name() {
        let store = EventStore::open_in_memory().await.unwrap();
        let mut supervisor = Supervisor::new(store).unwrap();

        let config = ConfigTree {
            dependencies: vec![],
            services: vec![Service {
                name: String::new(),
                working_directory: None,
                run_commands: vec!["true".to_string()],
                service_port: None,
                proxy_port: None,
                health_endpoint: None,
            }],
        };

        let err = supervisor.start(&config).await.unwrap_err();
        assert!(matches!(err, SubstrateError::Configuration(ConfigError::BlankName)));
    }

    #[tokio::test]
    async fn start_rejects_zero_service_port() {
        let store = EventStore::open_in_memory().await.unwrap();
        let mut supervisor = Supervisor::new(store).unwrap();

        let config = ConfigTree {
            dependencies: vec![],
            services: vec![Service {
                name: "svc1".to_string(),
                working_directory: None,
                run_commands: vec!["true".to_string()],
                service_port: Some(0),
                proxy_port: None,
                health_endpoint: None,
            }],
        };

        let err = supervisor.start(&config).await.unwrap_err();
        assert!(matches!(
            err,
            SubstrateError::Configuration(ConfigError::InvalidPort(0))
        ));
    }

    #[tokio::test]
    async fn echo_service_captures_logs_and_stop_is_idempotent() {
        let store = EventStore::open_in_memory().await.unwrap();
        let mut supervisor = Supervisor::new(store.clone()).unwrap();

        let config = ConfigTree {
            dependencies: vec![],
            services: vec![Service {
                name: "svc1".to_string(),
                working_directory: None,
                run_commands: vec!["echo Service started; sleep 60".to_string()],
                service_port: None,
                proxy_port: None,
                health_endpoint: None,
            }],
        };

        supervisor.start(&config).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let logs = store
            .get_logs("svc1", crate::event_store::Stream::Stdout)
            .await
            .unwrap();
        assert_eq!(logs, vec!["Service started\n".to_string()]);

        supervisor.stop().await.unwrap();
        supervisor.stop().await.unwrap();
    }
}
