use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::ctrl::controllers::ControlChannel;
use crate::ctrl::messages::{CircuitConfirmation, Fault};

#[derive(Debug)]
pub struct TrackingControlChannel {
    id: String,
    faults: Mutex<Vec<Fault>>,
    confirmations: Mutex<Vec<CircuitConfirmation>>,
}

impl TrackingControlChannel {
    pub fn new(id: &str) -> Arc<TrackingControlChannel> {
        Arc::new(TrackingControlChannel {
            id: id.to_string(),
            faults: Default::default(),
            confirmations: Default::default(),
        })
    }

    pub fn faults(&self) -> Vec<Fault> {
        self.faults.lock().clone()
    }

    pub fn confirmations(&self) -> Vec<CircuitConfirmation> {
        self.confirmations.lock().clone()
    }
}

#[async_trait]
impl ControlChannel for TrackingControlChannel {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn send_fault(&self, fault: Fault) -> anyhow::Result<()> {
        self.faults.lock().push(fault);
        Ok(())
    }

    async fn send_circuit_confirmation(&self, confirmation: CircuitConfirmation) -> anyhow::Result<()> {
        self.confirmations.lock().push(confirmation);
        Ok(())
    }
}
