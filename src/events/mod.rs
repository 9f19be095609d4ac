use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

use crate::models::{
    BillerName, InitializedItem, PurchaseProcess, PurchaseProcessState, SessionId, Transaction,
};

pub mod store;

#[derive(Debug, Error)]
pub enum EventSendError {
    #[error("event channel closed")]
    ChannelClosed,
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// A sender and the receiving end to hand to [`process_events`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), EventSendError> {
        self.sender
            .send(event)
            .await
            .map_err(|_| EventSendError::ChannelClosed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemSummary {
    pub item_id: Uuid,
    pub site_id: Uuid,
    pub amount: Decimal,
    pub is_cross_sale: bool,
    pub transactions: Vec<Transaction>,
}

impl From<&InitializedItem> for ItemSummary {
    fn from(item: &InitializedItem) -> Self {
        Self {
            item_id: item.item_id,
            site_id: item.site_id,
            amount: item.amount,
            is_cross_sale: item.is_cross_sale,
            transactions: item.transactions().to_vec(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FraudFlags {
    pub blocked: bool,
    pub force_three_d: bool,
    pub captcha_validated: bool,
}

/// Full outcome of a settled purchase, for downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseProcessed {
    pub session_id: SessionId,
    pub state: PurchaseProcessState,
    pub success: bool,
    pub biller: Option<BillerName>,
    pub is_third_party: bool,
    pub main_item: ItemSummary,
    pub cross_sales: Vec<ItemSummary>,
    pub gateway_submit_number: u32,
    pub fraud: FraudFlags,
    pub occurred_at: DateTime<Utc>,
}

impl PurchaseProcessed {
    pub fn from_process(process: &PurchaseProcess) -> Self {
        let biller = process.current_biller().ok();
        let fraud = process
            .fraud_advice()
            .map(|advice| FraudFlags {
                blocked: advice.is_blocked() || advice.is_blocked_on_process(),
                force_three_d: advice.is_force_three_d(),
                captcha_validated: advice.is_init_captcha_validated()
                    || advice.is_process_captcha_validated(),
            })
            .unwrap_or_default();
        let mut cross_sales: Vec<ItemSummary> =
            process.cross_sales().map(ItemSummary::from).collect();
        cross_sales.sort_by_key(|item| item.item_id);

        Self {
            session_id: process.session_id(),
            state: process.state(),
            success: process.was_main_item_purchase_successful(),
            biller: biller.map(|b| b.name()),
            is_third_party: biller.map(|b| b.is_third_party()).unwrap_or(false),
            main_item: ItemSummary::from(process.main_item()),
            cross_sales,
            gateway_submit_number: process.gateway_submit_number(),
            fraud,
            occurred_at: Utc::now(),
        }
    }
}

// Events published by the gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    PurchaseInitialized {
        session_id: SessionId,
        state: PurchaseProcessState,
    },
    PurchaseProcessed(Box<PurchaseProcessed>),
}

impl Event {
    pub fn session_id(&self) -> SessionId {
        match self {
            Event::PurchaseInitialized { session_id, .. } => *session_id,
            Event::PurchaseProcessed(processed) => processed.session_id,
        }
    }
}

// Handlers process events asynchronously; a failing handler never blocks the others.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_event(&self, event: &Event) -> Result<(), String>;
}

/// Writes every event to the log.
#[derive(Debug, Default)]
pub struct LoggingEventHandler;

#[async_trait]
impl EventHandler for LoggingEventHandler {
    fn name(&self) -> &'static str {
        "logging"
    }

    async fn handle_event(&self, event: &Event) -> Result<(), String> {
        match event {
            Event::PurchaseInitialized { session_id, state } => {
                info!(%session_id, %state, "purchase initialized");
            }
            Event::PurchaseProcessed(processed) => {
                info!(
                    session_id = %processed.session_id,
                    state = %processed.state,
                    success = processed.success,
                    biller = ?processed.biller,
                    transactions = processed.main_item.transactions.len(),
                    "purchase processed"
                );
            }
        }
        Ok(())
    }
}

// Drains the channel and fans each event out to every handler.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, handlers: Vec<Arc<dyn EventHandler>>) {
    info!(handlers = handlers.len(), "Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let session_id = event.session_id();
        let results = join_all(handlers.iter().map(|handler| {
            let event = &event;
            async move { (handler.name(), handler.handle_event(event).await) }
        }))
        .await;

        for (handler, result) in results {
            if let Err(e) = result {
                error!(%session_id, handler, error = %e, "event handler failed");
            }
        }
    }

    info!("Event channel closed, stopping event processing loop");
}
