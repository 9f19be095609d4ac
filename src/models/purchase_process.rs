//! The purchase process aggregate.
//!
//! Every change goes through [`PurchaseProcess::record`], which applies the
//! event and queues it for the event store. Restoring a process is a fold of
//! its log into a fresh aggregate, so a replay rebuilds the exact same state,
//! cascade position, fraud advice and transactions.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::events::store::PurchaseProcessEvent;

use super::{
    biller::Biller,
    cascade::{Cascade, CascadeError},
    fraud_advice::{FraudAdvice, FraudAdviceError},
    initialized_item::{InitializedItem, Transaction, TransactionState},
    purchase_process_state::{IllegalStateTransition, PurchaseProcessState},
    values::{PaymentInstrument, SessionId},
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PurchaseProcessError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalStateTransition),
    #[error(transparent)]
    Cascade(#[from] CascadeError),
    #[error(transparent)]
    FraudAdvice(#[from] FraudAdviceError),
    #[error("no cascade has been attached to session {0}")]
    MissingCascade(SessionId),
    #[error("no fraud advice has been attached to session {0}")]
    MissingFraudAdvice(SessionId),
    #[error("item {0} is not part of this purchase")]
    UnknownItem(Uuid),
    #[error("cannot restore a purchase process from an empty event log")]
    EmptyEventLog,
    #[error("event log must start with process creation, found {0}")]
    InvalidFirstEvent(&'static str),
    #[error("process creation recorded twice")]
    DuplicateCreation,
}

/// Captcha challenge being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptchaStep {
    Init,
    Process,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseProcess {
    session_id: SessionId,
    public_key_index: u32,
    state: PurchaseProcessState,
    cascade: Option<Cascade>,
    fraud_advice: Option<FraudAdvice>,
    payment: Option<PaymentInstrument>,
    gateway_submit_number: u32,
    main_item_id: Uuid,
    items: HashMap<Uuid, InitializedItem>,
    version: u64,
    uncommitted: Vec<PurchaseProcessEvent>,
}

impl PurchaseProcess {
    pub fn create(
        session_id: SessionId,
        public_key_index: u32,
        main_item: InitializedItem,
        cross_sales: Vec<InitializedItem>,
    ) -> Self {
        let main_item_id = main_item.item_id;
        let items: Vec<InitializedItem> = std::iter::once(main_item).chain(cross_sales).collect();
        let mut process = Self::blank(session_id, public_key_index, main_item_id, &items);
        process.version = 0;
        process.uncommitted.push(PurchaseProcessEvent::ProcessCreated {
            session_id,
            public_key_index,
            main_item_id,
            items,
        });
        info!(%session_id, "purchase process created");
        process
    }

    fn blank(
        session_id: SessionId,
        public_key_index: u32,
        main_item_id: Uuid,
        items: &[InitializedItem],
    ) -> Self {
        Self {
            session_id,
            public_key_index,
            state: PurchaseProcessState::Created,
            cascade: None,
            fraud_advice: None,
            payment: None,
            gateway_submit_number: 0,
            main_item_id,
            items: items.iter().map(|i| (i.item_id, i.clone())).collect(),
            version: 1,
            uncommitted: Vec::new(),
        }
    }

    fn from_created(event: &PurchaseProcessEvent) -> Result<Self, PurchaseProcessError> {
        match event {
            PurchaseProcessEvent::ProcessCreated {
                session_id,
                public_key_index,
                main_item_id,
                items,
            } => {
                if !items.iter().any(|i| i.item_id == *main_item_id) {
                    return Err(PurchaseProcessError::UnknownItem(*main_item_id));
                }
                Ok(Self::blank(*session_id, *public_key_index, *main_item_id, items))
            }
            other => Err(PurchaseProcessError::InvalidFirstEvent(other.event_type())),
        }
    }

    /// Rebuilds a process from its ordered log.
    pub fn restore(events: &[PurchaseProcessEvent]) -> Result<Self, PurchaseProcessError> {
        let (first, rest) = events
            .split_first()
            .ok_or(PurchaseProcessError::EmptyEventLog)?;
        let process = rest
            .iter()
            .try_fold(Self::from_created(first)?, |mut process, event| {
                process.apply(event)?;
                process.version += 1;
                Ok::<_, PurchaseProcessError>(process)
            })?;
        debug!(
            session_id = %process.session_id,
            version = process.version,
            state = %process.state,
            "purchase process restored"
        );
        Ok(process)
    }

    fn apply(&mut self, event: &PurchaseProcessEvent) -> Result<(), PurchaseProcessError> {
        match event {
            PurchaseProcessEvent::ProcessCreated { .. } => {
                return Err(PurchaseProcessError::DuplicateCreation);
            }
            PurchaseProcessEvent::FraudAdviceAttached { advice } => {
                self.fraud_advice = Some(advice.clone());
            }
            PurchaseProcessEvent::CascadeAttached { cascade } => {
                self.cascade = Some(cascade.clone());
            }
            PurchaseProcessEvent::BillerAdvanced {
                current_biller,
                submit_number,
            } => {
                let cascade = self
                    .cascade
                    .as_ref()
                    .ok_or(PurchaseProcessError::MissingCascade(self.session_id))?;
                self.cascade = Some(Cascade::resume(
                    cascade.billers().to_vec(),
                    *current_biller,
                    *submit_number,
                )?);
            }
            PurchaseProcessEvent::GatewaySubmitted {
                gateway_submit_number,
            } => {
                self.gateway_submit_number = *gateway_submit_number;
            }
            PurchaseProcessEvent::TransactionRecorded {
                item_id,
                transaction,
            } => {
                self.items
                    .get_mut(item_id)
                    .ok_or(PurchaseProcessError::UnknownItem(*item_id))?
                    .add_transaction(transaction.clone());
            }
            PurchaseProcessEvent::CrossSaleSelected { item_id } => {
                self.items
                    .get_mut(item_id)
                    .ok_or(PurchaseProcessError::UnknownItem(*item_id))?
                    .is_cross_sale_selected = true;
            }
            PurchaseProcessEvent::PaymentAttached { payment } => {
                self.payment = Some(payment.clone());
            }
            PurchaseProcessEvent::StateChanged { to, .. } => {
                self.state = *to;
            }
        }
        Ok(())
    }

    fn record(&mut self, event: PurchaseProcessEvent) -> Result<(), PurchaseProcessError> {
        self.apply(&event)?;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Drains events not yet persisted, returning them with the version they extend.
    pub fn take_uncommitted_events(&mut self) -> (u64, Vec<PurchaseProcessEvent>) {
        let events = std::mem::take(&mut self.uncommitted);
        let base = self.version;
        self.version += events.len() as u64;
        (base, events)
    }

    pub fn has_uncommitted_events(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn public_key_index(&self) -> u32 {
        self.public_key_index
    }

    pub fn state(&self) -> PurchaseProcessState {
        self.state
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn cascade(&self) -> Option<&Cascade> {
        self.cascade.as_ref()
    }

    pub fn fraud_advice(&self) -> Option<&FraudAdvice> {
        self.fraud_advice.as_ref()
    }

    pub fn gateway_submit_number(&self) -> u32 {
        self.gateway_submit_number
    }

    /// Instrument of the latest submission, kept for charges that happen on a later request.
    pub fn payment(&self) -> Option<&PaymentInstrument> {
        self.payment.as_ref()
    }

    pub fn main_item(&self) -> &InitializedItem {
        // the creation event always carries the main item
        &self.items[&self.main_item_id]
    }

    pub fn item(&self, item_id: Uuid) -> Option<&InitializedItem> {
        self.items.get(&item_id)
    }

    pub fn cross_sales(&self) -> impl Iterator<Item = &InitializedItem> {
        self.items.values().filter(|item| item.is_cross_sale)
    }

    pub fn selected_cross_sales(&self) -> Vec<&InitializedItem> {
        let mut selected: Vec<&InitializedItem> = self
            .cross_sales()
            .filter(|item| item.is_cross_sale_selected)
            .collect();
        selected.sort_by_key(|item| item.item_id);
        selected
    }

    fn transition(
        &mut self,
        next: Result<PurchaseProcessState, IllegalStateTransition>,
    ) -> Result<(), PurchaseProcessError> {
        let from = self.state;
        let to = next.map_err(|e| {
            warn!(session_id = %self.session_id, error = %e, "illegal state transition");
            e
        })?;
        if from != to {
            debug!(session_id = %self.session_id, %from, %to, "state changed");
            self.record(PurchaseProcessEvent::StateChanged { from, to })?;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.validate())
    }

    pub fn block_due_to_fraud_advice(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.block_due_to_fraud_advice())
    }

    pub fn start_processing(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.start_processing())
    }

    pub fn start_pending(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.start_pending())
    }

    pub fn authenticate_three_d(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.authenticate_three_d())
    }

    pub fn perform_three_d_lookup(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.perform_three_d_lookup())
    }

    pub fn redirect(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.redirect())
    }

    pub fn finish_processing(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.finish_processing())
    }

    pub fn no_more_billers_available(&mut self) -> Result<(), PurchaseProcessError> {
        self.transition(self.state.no_more_billers_available())
    }

    /// Attaches or replaces the fraud advice snapshot; it is never removed.
    pub fn set_fraud_advice(&mut self, advice: FraudAdvice) -> Result<(), PurchaseProcessError> {
        self.record(PurchaseProcessEvent::FraudAdviceAttached { advice })
    }

    pub fn init_state_according_to_fraud_advice(&mut self) -> Result<(), PurchaseProcessError> {
        let blocked = self
            .fraud_advice
            .as_ref()
            .ok_or(PurchaseProcessError::MissingFraudAdvice(self.session_id))?
            .is_blocked();
        if blocked {
            info!(session_id = %self.session_id, "purchase blocked by fraud advice");
            self.block_due_to_fraud_advice()
        } else {
            self.validate()
        }
    }

    /// Answers a captcha challenge. Once every advised challenge is passed a
    /// blocked process becomes valid again.
    pub fn validate_captcha(&mut self, step: CaptchaStep) -> Result<(), PurchaseProcessError> {
        let mut advice = self
            .fraud_advice
            .clone()
            .ok_or(PurchaseProcessError::MissingFraudAdvice(self.session_id))?;
        match step {
            CaptchaStep::Init => advice.validate_init_captcha()?,
            CaptchaStep::Process => advice.validate_process_captcha()?,
        }
        let cleared = advice.is_captcha_cleared();
        self.set_fraud_advice(advice)?;

        if cleared && self.state == PurchaseProcessState::BlockedDueToFraudAdvice {
            self.validate()?;
        }
        Ok(())
    }

    pub fn set_cascade(&mut self, cascade: Cascade) -> Result<(), PurchaseProcessError> {
        self.record(PurchaseProcessEvent::CascadeAttached { cascade })
    }

    pub fn current_biller(&self) -> Result<Biller, PurchaseProcessError> {
        self.cascade
            .as_ref()
            .map(Cascade::current_biller)
            .ok_or(PurchaseProcessError::MissingCascade(self.session_id))
    }

    /// Advances the cascade for the next submission.
    pub fn next_biller(&mut self) -> Result<Biller, PurchaseProcessError> {
        let mut cascade = self
            .cascade
            .clone()
            .ok_or(PurchaseProcessError::MissingCascade(self.session_id))?;
        let biller = cascade.next_biller()?;
        self.record(PurchaseProcessEvent::BillerAdvanced {
            current_biller: biller.name(),
            submit_number: cascade.submit_number(),
        })?;
        Ok(biller)
    }

    pub fn increment_gateway_submit_number(&mut self) -> Result<u32, PurchaseProcessError> {
        let next = self.gateway_submit_number + 1;
        self.record(PurchaseProcessEvent::GatewaySubmitted {
            gateway_submit_number: next,
        })?;
        Ok(next)
    }

    pub fn add_transaction(
        &mut self,
        item_id: Uuid,
        transaction: Transaction,
    ) -> Result<(), PurchaseProcessError> {
        self.record(PurchaseProcessEvent::TransactionRecorded {
            item_id,
            transaction,
        })
    }

    pub fn select_cross_sale(&mut self, item_id: Uuid) -> Result<(), PurchaseProcessError> {
        match self.items.get(&item_id) {
            Some(item) if item.is_cross_sale => {
                self.record(PurchaseProcessEvent::CrossSaleSelected { item_id })
            }
            _ => Err(PurchaseProcessError::UnknownItem(item_id)),
        }
    }

    pub fn attach_payment(
        &mut self,
        payment: PaymentInstrument,
    ) -> Result<(), PurchaseProcessError> {
        if self.payment.as_ref() == Some(&payment) {
            return Ok(());
        }
        self.record(PurchaseProcessEvent::PaymentAttached { payment })
    }

    /// Parks the process in `Pending` when the current biller is third-party.
    /// No-op for first-party billers, and while a fraud block is in force.
    pub fn set_state_if_third_party(&mut self) -> Result<(), PurchaseProcessError> {
        if !self.current_biller()?.is_third_party() {
            return Ok(());
        }
        if self.state == PurchaseProcessState::BlockedDueToFraudAdvice {
            warn!(
                session_id = %self.session_id,
                "third-party biller selected while blocked; fraud block takes precedence"
            );
            return Ok(());
        }
        self.transition(self.state.force_third_party_pending())
    }

    /// Converges after every submission attempt.
    ///
    /// An approved main item settles the purchase. A failed attempt settles it
    /// as failed once the cascade has nothing left to try, otherwise the
    /// process goes back to `Valid` for the next cascade step. A third-party
    /// attempt in `Pending` cannot be retried and always settles.
    pub fn post_processing(&mut self) -> Result<(), PurchaseProcessError> {
        let last_state = self.main_item().last_transaction().map(|t| t.state);

        if self.state == PurchaseProcessState::Pending
            || last_state == Some(TransactionState::Approved)
        {
            return self.finish_processing();
        }
        if last_state == Some(TransactionState::Pending) {
            return Ok(());
        }

        let exhausted = self
            .cascade
            .as_ref()
            .ok_or(PurchaseProcessError::MissingCascade(self.session_id))?
            .is_exhausted();
        if exhausted {
            info!(session_id = %self.session_id, "cascade exhausted after failed attempt");
            self.finish_processing()
        } else {
            self.validate()
        }
    }

    pub fn was_main_item_purchase_successful(&self) -> bool {
        self.main_item().was_successful()
    }

    pub fn is_fraud_blocked(&self) -> bool {
        self.state == PurchaseProcessState::BlockedDueToFraudAdvice
    }

    pub fn is_force_three_d(&self) -> bool {
        self.fraud_advice
            .as_ref()
            .map(FraudAdvice::is_force_three_d)
            .unwrap_or(false)
    }
}
