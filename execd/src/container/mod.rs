//! Container lookup
//!
//! Containers are created and torn down elsewhere; execd only asks "does this
//! reference name a running container, and what are its defaults?".
//!
//! # Architecture
//!
//! - [`ContainerProvider`]: lookup seam used by the exec service
//! - [`OciStateProvider`]: reads OCI runtime state from a state root
//! - [`StaticContainers`]: in-memory provider for embedding and tests
//! - [`UserDb`]: identity resolution against the container's user database
//! - [`Platform`]: native path rendering per container platform

mod oci;
mod platform;
mod user;

pub use oci::OciStateProvider;
pub use platform::Platform;
pub use user::{ContainerUser, Identity, UserDb};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;

/// What the exec subsystem needs to know about a container.
#[derive(Clone, Debug)]
pub struct ContainerRecord {
    pub id: String,
    pub running: bool,
    /// Init process whose namespaces exec processes join.
    /// `None` shares the daemon's own namespaces.
    pub pid: Option<i32>,
    /// Host path of the container root filesystem.
    pub rootfs: PathBuf,
    /// Default environment, `KEY=VALUE` entries.
    pub env: Vec<String>,
    /// Image-defined working directory.
    pub working_dir: String,
    pub user: ContainerUser,
    pub platform: Platform,
}

/// Resolves container references.
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Look up a container by reference. `None` if it does not exist.
    async fn lookup(&self, reference: &str) -> Option<ContainerRecord>;
}

/// In-memory container table.
#[derive(Default)]
pub struct StaticContainers {
    containers: RwLock<HashMap<String, ContainerRecord>>,
}

impl StaticContainers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a container.
    pub async fn insert(&self, record: ContainerRecord) {
        self.containers
            .write()
            .await
            .insert(record.id.clone(), record);
    }

    /// Flip the running flag of a known container.
    pub async fn set_running(&self, id: &str, running: bool) -> bool {
        match self.containers.write().await.get_mut(id) {
            Some(record) => {
                record.running = running;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ContainerProvider for StaticContainers {
    async fn lookup(&self, reference: &str) -> Option<ContainerRecord> {
        self.containers.read().await.get(reference).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ContainerRecord {
        ContainerRecord {
            id: id.to_string(),
            running: true,
            pid: None,
            rootfs: PathBuf::from("/"),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            working_dir: "/".to_string(),
            user: ContainerUser::default(),
            platform: Platform::Linux,
        }
    }

    #[tokio::test]
    async fn test_static_lookup() {
        let containers = StaticContainers::new();
        containers.insert(record("web")).await;

        assert!(containers.lookup("web").await.is_some());
        assert!(containers.lookup("db").await.is_none());
    }

    #[tokio::test]
    async fn test_static_set_running() {
        let containers = StaticContainers::new();
        containers.insert(record("web")).await;

        assert!(containers.set_running("web", false).await);
        assert!(!containers.lookup("web").await.unwrap().running);
        assert!(!containers.set_running("db", false).await);
    }
}
