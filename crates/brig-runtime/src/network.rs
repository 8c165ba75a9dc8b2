use crate::RuntimeError;
use async_trait::async_trait;
use brig_schema::{ContainerId, NetworkMode};
use std::path::PathBuf;
use tracing::debug;

/// Contract with the host's network namespace provisioning.
///
/// Implementations serialize setup and teardown across the host; callers may
/// invoke them concurrently for different containers.
#[async_trait]
pub trait NetworkSetup: Send + Sync {
    /// Prepare networking for `id`. Returns a network namespace path for the
    /// container to join, or `None` when no external namespace is involved
    /// (the host's is shared for `Enabled`, a fresh loopback-only one is
    /// created by the runtime for `Off`).
    async fn enable(
        &self,
        id: &ContainerId,
        mode: NetworkMode,
    ) -> Result<Option<PathBuf>, RuntimeError>;

    /// Release whatever `enable` set up. Must succeed for unknown ids.
    async fn disable(&self, id: &ContainerId) -> Result<(), RuntimeError>;
}

/// No provisioning at all: `Enabled` shares the host network namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostNetwork;

#[async_trait]
impl NetworkSetup for HostNetwork {
    async fn enable(
        &self,
        id: &ContainerId,
        mode: NetworkMode,
    ) -> Result<Option<PathBuf>, RuntimeError> {
        debug!("network for {id}: {mode} (host)");
        Ok(None)
    }

    async fn disable(&self, _id: &ContainerId) -> Result<(), RuntimeError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn host_network_never_provides_a_namespace() {
        let net = HostNetwork;
        let id = ContainerId::new("c1");
        assert!(net.enable(&id, NetworkMode::Enabled).await.unwrap().is_none());
        assert!(net.enable(&id, NetworkMode::Off).await.unwrap().is_none());
        net.disable(&id).await.unwrap();
        net.disable(&ContainerId::new("unknown")).await.unwrap();
    }
}
