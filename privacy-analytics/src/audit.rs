use std::{collections::VecDeque, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{Principal, QueryShape};

/// Budget-relevant state transitions. True statistics never appear here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    Release {
        ts: DateTime<Utc>,
        principal: Principal,
        query_id: String,
        shape: QueryShape,
        epsilon: f64,
        delta: f64,
        prior_releases: u32,
    },
    Rejection {
        ts: DateTime<Utc>,
        principal: Principal,
        reason: String,
        message: String,
    },
    Rollback {
        ts: DateTime<Utc>,
        principal: Principal,
        epsilon: f64,
        delta: f64,
        reason: String,
    },
    BudgetReset {
        ts: DateTime<Utc>,
        principal: Principal,
    },
}

impl AuditEvent {
    pub fn release(
        principal: &Principal,
        query_id: String,
        shape: QueryShape,
        epsilon: f64,
        delta: f64,
        prior_releases: u32,
    ) -> Self {
        Self::Release {
            ts: Utc::now(),
            principal: principal.clone(),
            query_id,
            shape,
            epsilon,
            delta,
            prior_releases,
        }
    }

    pub fn rejection(principal: &Principal, reason: &str, message: String) -> Self {
        Self::Rejection {
            ts: Utc::now(),
            principal: principal.clone(),
            reason: reason.to_owned(),
            message,
        }
    }

    pub fn rollback(principal: &Principal, epsilon: f64, delta: f64, reason: &str) -> Self {
        Self::Rollback {
            ts: Utc::now(),
            principal: principal.clone(),
            epsilon,
            delta,
            reason: reason.to_owned(),
        }
    }

    pub fn budget_reset(principal: &Principal) -> Self {
        Self::BudgetReset {
            ts: Utc::now(),
            principal: principal.clone(),
        }
    }

    pub fn principal(&self) -> &Principal {
        match self {
            AuditEvent::Release { principal, .. }
            | AuditEvent::Rejection { principal, .. }
            | AuditEvent::Rollback { principal, .. }
            | AuditEvent::BudgetReset { principal, .. } => principal,
        }
    }
}

pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()>;
}

/// No-op audit sink (useful for demos and tests).
#[derive(Clone, Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Keeps the most recent `capacity` events in memory.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    events: Mutex<VecDeque<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            events: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, principal: &Principal) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.principal() == principal)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let mut events = self.events.lock();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }
}

/// Forwards events to `tracing` under the `privacy_audit` target.
#[derive(Clone, Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        let payload = serde_json::to_string(&event)?;
        match &event {
            AuditEvent::Release { .. } | AuditEvent::BudgetReset { .. } => {
                tracing::info!(target: "privacy_audit", principal = %event.principal(), %payload)
            }
            AuditEvent::Rejection { .. } | AuditEvent::Rollback { .. } => {
                tracing::warn!(target: "privacy_audit", principal = %event.principal(), %payload)
            }
        }
        Ok(())
    }
}

/// Fan-out sink for emitting to multiple audit backends.
pub struct CompositeAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl CompositeAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for CompositeAuditSink {
    fn emit(&self, event: AuditEvent) -> anyhow::Result<()> {
        for sink in &self.sinks {
            sink.emit(event.clone())?;
        }
        Ok(())
    }
}
