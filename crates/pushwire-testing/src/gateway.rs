//! Gateway doubles.

use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, PoisonError},
};

use pushwire_core::{App, Notification, NotificationId, Protocol};
use pushwire_delivery::{
    error::Result, gateway::BoxFuture, DeliveryError, Gateway, GatewayFactory,
};
use tokio::sync::Semaphore;

/// Gateway that answers from a script and records every batch it sees.
///
/// Once the script runs out every send succeeds. When gated, each send waits
/// for a permit from [`release`](Self::release) before answering.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    outcomes: Mutex<VecDeque<Result<()>>>,
    batches: Mutex<Vec<Vec<NotificationId>>>,
    gate: Option<Semaphore>,
}

impl ScriptedGateway {
    /// Creates a gateway that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a gateway whose sends block until released.
    pub fn gated() -> Self {
        Self { gate: Some(Semaphore::new(0)), ..Self::default() }
    }

    /// Queues the outcome of a future send.
    pub fn push_outcome(&self, outcome: Result<()>) {
        self.outcomes.lock().unwrap_or_else(PoisonError::into_inner).push_back(outcome);
    }

    /// Queues the same failure for the next `times` sends.
    pub fn fail_times(&self, error: &DeliveryError, times: usize) {
        for _ in 0..times {
            self.push_outcome(Err(error.clone()));
        }
    }

    /// Lets `sends` blocked or future sends complete.
    pub fn release(&self, sends: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(sends);
        }
    }

    /// Every batch sent so far, as notification ids.
    pub fn batches(&self) -> Vec<Vec<NotificationId>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Total notifications sent so far.
    pub fn sent_count(&self) -> usize {
        self.batches().iter().map(Vec::len).sum()
    }
}

impl Gateway for ScriptedGateway {
    fn send<'a>(&'a self, _app: &'a App, batch: &'a [Notification]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.batches
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(batch.iter().map(|n| n.id).collect());

            if let Some(gate) = &self.gate {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
            }

            self.outcomes.lock().unwrap_or_else(PoisonError::into_inner).pop_front().unwrap_or(Ok(()))
        })
    }
}

/// Factory handing the same gateway to every app, except for protocols it
/// is told to reject.
#[derive(Debug, Clone)]
pub struct StaticGatewayFactory {
    gateway: Arc<ScriptedGateway>,
    rejected: HashSet<Protocol>,
}

impl StaticGatewayFactory {
    /// Creates a factory sharing `gateway`.
    pub fn new(gateway: Arc<ScriptedGateway>) -> Self {
        Self { gateway, rejected: HashSet::new() }
    }

    /// Makes the factory fail for apps on `protocol`.
    #[must_use]
    pub fn rejecting(mut self, protocol: Protocol) -> Self {
        self.rejected.insert(protocol);
        self
    }
}

impl GatewayFactory for StaticGatewayFactory {
    fn build(&self, app: &App) -> Result<Arc<dyn Gateway>> {
        if self.rejected.contains(&app.protocol) {
            return Err(DeliveryError::configuration(format!(
                "protocol {} not available",
                app.protocol
            )));
        }
        Ok(self.gateway.clone())
    }
}
