use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::{
    biller::BillerName, cascade::Cascade, fraud_advice::FraudAdvice,
    initialized_item::{InitializedItem, Transaction},
    purchase_process_state::PurchaseProcessState,
    values::{PaymentInstrument, SessionId},
};

/// Facts recorded by a purchase process, in the order they happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PurchaseProcessEvent {
    ProcessCreated {
        session_id: SessionId,
        public_key_index: u32,
        main_item_id: Uuid,
        items: Vec<InitializedItem>,
    },
    FraudAdviceAttached {
        advice: FraudAdvice,
    },
    CascadeAttached {
        cascade: Cascade,
    },
    BillerAdvanced {
        current_biller: BillerName,
        submit_number: u32,
    },
    GatewaySubmitted {
        gateway_submit_number: u32,
    },
    TransactionRecorded {
        item_id: Uuid,
        transaction: Transaction,
    },
    CrossSaleSelected {
        item_id: Uuid,
    },
    PaymentAttached {
        payment: PaymentInstrument,
    },
    StateChanged {
        from: PurchaseProcessState,
        to: PurchaseProcessState,
    },
}

impl PurchaseProcessEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PurchaseProcessEvent::ProcessCreated { .. } => "process_created",
            PurchaseProcessEvent::FraudAdviceAttached { .. } => "fraud_advice_attached",
            PurchaseProcessEvent::CascadeAttached { .. } => "cascade_attached",
            PurchaseProcessEvent::BillerAdvanced { .. } => "biller_advanced",
            PurchaseProcessEvent::GatewaySubmitted { .. } => "gateway_submitted",
            PurchaseProcessEvent::TransactionRecorded { .. } => "transaction_recorded",
            PurchaseProcessEvent::CrossSaleSelected { .. } => "cross_sale_selected",
            PurchaseProcessEvent::PaymentAttached { .. } => "payment_attached",
            PurchaseProcessEvent::StateChanged { .. } => "state_changed",
        }
    }
}

/// One entry of the append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub session_id: SessionId,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: PurchaseProcessEvent,
}

#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Concurrent modification of session {session_id}: expected version {expected}, found {actual}")]
    VersionConflict {
        session_id: SessionId,
        expected: u64,
        actual: u64,
    },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Event store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends events after `expected_version` entries; fails if someone else appended first.
    async fn append(
        &self,
        session_id: SessionId,
        expected_version: u64,
        events: Vec<PurchaseProcessEvent>,
    ) -> Result<u64, EventStoreError>;

    /// Loads the whole log for a session in recorded order. Empty when unknown.
    async fn load(&self, session_id: SessionId) -> Result<Vec<RecordedEvent>, EventStoreError>;
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    streams: Arc<DashMap<SessionId, Vec<RecordedEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        session_id: SessionId,
        expected_version: u64,
        events: Vec<PurchaseProcessEvent>,
    ) -> Result<u64, EventStoreError> {
        let mut stream = self.streams.entry(session_id).or_default();
        let actual = stream.len() as u64;
        if actual != expected_version {
            warn!(%session_id, expected_version, actual, "rejecting append on stale version");
            return Err(EventStoreError::VersionConflict {
                session_id,
                expected: expected_version,
                actual,
            });
        }

        let recorded_at = Utc::now();
        for event in events {
            let sequence = stream.len() as u64 + 1;
            debug!(%session_id, sequence, event_type = event.event_type(), "appending event");
            stream.push(RecordedEvent {
                session_id,
                sequence,
                recorded_at,
                event,
            });
        }
        Ok(stream.len() as u64)
    }

    async fn load(&self, session_id: SessionId) -> Result<Vec<RecordedEvent>, EventStoreError> {
        Ok(self
            .streams
            .get(&session_id)
            .map(|stream| stream.clone())
            .unwrap_or_default())
    }
}
