//! The validated configuration tree the [`crate::Supervisor`] consumes.
//!
//! Parsing a textual configuration language into this tree is not this
//! crate's concern: callers construct or deserialize a [`ConfigEntity`]
//! tree directly.

use serde::Deserialize;

/// A user-defined long-running process.
#[derive(Debug, Clone, Deserialize)]
pub struct Service {
    pub name: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    pub run_commands: Vec<String>,
    #[serde(default)]
    pub service_port: Option<u16>,
    #[serde(default)]
    pub proxy_port: Option<u16>,
    #[serde(default)]
    pub health_endpoint: Option<String>,
}

/// Which pre-packaged infrastructure component a [`ManagedDependency`] brings up.
///
/// A tagged sum with exactly one constructor active: a config that names
/// both or neither of `kafka`/`localstack` simply has no representation
/// here, rather than being caught by a runtime check against two
/// `Option` fields.
#[derive(Debug, Clone, Deserialize)]
pub enum ManagedDependencyKind {
    Kafka { port: u16 },
    LocalStack { port: u16 },
}

/// A pre-packaged infrastructure component started via a compose template.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagedDependency {
    pub name: String,
    #[serde(flatten)]
    pub kind: ManagedDependencyKind,
}

/// One entity in a configuration tree: either a [`Service`] or a [`ManagedDependency`].
#[derive(Debug, Clone, Deserialize)]
pub enum ConfigEntity {
    Service(Service),
    ManagedDependency(ManagedDependency),
}

/// A single parsed configuration file's worth of entities, in declaration order.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigTree {
    #[serde(default)]
    pub dependencies: Vec<ManagedDependency>,
    #[serde(default)]
    pub services: Vec<Service>,
}

impl ConfigTree {
    /// Iterates entities in the order the Supervisor must start them in:
    /// managed dependencies first, then services, both in declaration order.
    pub fn entities_in_start_order(&self) -> impl Iterator<Item = ConfigEntity> + '_ {
        self.dependencies
            .iter()
            .cloned()
            .map(ConfigEntity::ManagedDependency)
            .chain(self.services.iter().cloned().map(ConfigEntity::Service))
    }
}
