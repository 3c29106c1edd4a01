use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)] use mockall::automock;
use tracing::{debug, error};

use crate::ctrl::messages::{CircuitConfirmation, Fault};

/// A connection to one controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlChannel: Send + Sync + 'static {
    fn id(&self) -> String;
    async fn send_fault(&self, fault: Fault) -> anyhow::Result<()>;
    async fn send_circuit_confirmation(&self, confirmation: CircuitConfirmation) -> anyhow::Result<()>;
}

/// The controllers this router is currently connected to, by id
#[derive(Default)]
pub struct NetworkControllers {
    channels: DashMap<String, Arc<dyn ControlChannel>>,
}

impl NetworkControllers {
    pub fn new() -> NetworkControllers {
        Default::default()
    }

    pub fn add(&self, channel: Arc<dyn ControlChannel>) {
        let id = channel.id();
        debug!("controller {} connected", id);
        self.channels.insert(id, channel);
    }

    pub fn remove(&self, ctrl_id: &str) {
        if self.channels.remove(ctrl_id).is_some() {
            debug!("controller {} disconnected", ctrl_id);
        }
    }

    pub fn get(&self, ctrl_id: &str) -> Option<Arc<dyn ControlChannel>> {
        self.channels.get(ctrl_id)
            .map(|e| e.value().clone())
    }

    pub fn all(&self) -> Vec<Arc<dyn ControlChannel>> {
        self.channels.iter()
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub async fn broadcast_fault(&self, fault: &Fault) {
        for channel in self.all() {
            if let Err(e) = channel.send_fault(fault.clone()).await {
                error!("unable to send {} {} to controller {}: {}", fault.subject, fault.id, channel.id(), e);
            }
        }
    }
}
