//! Cluster address lookup
//!
//! Commands name their target by role (control node, leader, application
//! leader) or by address. [`Topology`] is the boundary to whatever knows the
//! cluster layout; [`StaticTopology`] covers the common case of fixed
//! addresses from configuration.

use crate::{Error, Result, RunnerConfig};
use async_trait::async_trait;
use nodeshell_ssh::{ControlNode, TransportError};
use std::sync::Arc;

/// Resolves cluster roles to node addresses
#[async_trait]
pub trait Topology: Send + Sync {
    /// Address of the control node; every other node is reached through it
    async fn control_node_address(&self) -> Result<String>;

    /// Address of the current leader
    async fn leader_node_address(&self) -> Result<String>;

    /// Address of the current application (Marathon) leader
    async fn app_leader_address(&self) -> Result<String>;
}

/// Fixed addresses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticTopology {
    master: String,
    leader: Option<String>,
    app_leader: Option<String>,
}

impl StaticTopology {
    /// Topology where every role lives on `master`
    pub fn new(master: impl Into<String>) -> Self {
        Self {
            master: master.into(),
            leader: None,
            app_leader: None,
        }
    }

    /// Build from configured addresses; the control node is required
    pub fn from_config(config: &RunnerConfig) -> Result<Self> {
        let master = config
            .master
            .clone()
            .ok_or_else(|| Error::Config(format!("control node address not set ({}_MASTER)", crate::config::ENV_PREFIX)))?;

        Ok(Self {
            master,
            leader: config.leader.clone(),
            app_leader: config.app_leader.clone(),
        })
    }

    /// Put the leader on another node
    pub fn with_leader(mut self, leader: impl Into<String>) -> Self {
        self.leader = Some(leader.into());
        self
    }

    /// Put the application leader on another node
    pub fn with_app_leader(mut self, app_leader: impl Into<String>) -> Self {
        self.app_leader = Some(app_leader.into());
        self
    }
}

#[async_trait]
impl Topology for StaticTopology {
    async fn control_node_address(&self) -> Result<String> {
        Ok(self.master.clone())
    }

    async fn leader_node_address(&self) -> Result<String> {
        Ok(self.leader.clone().unwrap_or_else(|| self.master.clone()))
    }

    async fn app_leader_address(&self) -> Result<String> {
        Ok(self.app_leader.clone().unwrap_or_else(|| self.master.clone()))
    }
}

/// Lets the connection pool find its jump host through a [`Topology`]
#[derive(Clone)]
pub struct TopologyControlNode(pub Arc<dyn Topology>);

#[async_trait]
impl ControlNode for TopologyControlNode {
    async fn address(&self) -> std::result::Result<String, TransportError> {
        self.0
            .control_node_address()
            .await
            .map_err(|e| TransportError::Topology(e.to_string()))
    }
}
