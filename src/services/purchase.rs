//! Purchase orchestration.
//!
//! [`PurchaseService`] drives a purchase process through its lifecycle across
//! several requests: init (fraud screening, stored cards), process (template
//! validation, process-time screening, the biller cascade, cross-sales),
//! and the asynchronous completions for 3-D Secure and third-party billers.
//! Every request restores the process from its event log, mutates it, and
//! appends the new events with the version it was loaded at.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::config::CascadeEntry;
use crate::errors::ServiceError;
use crate::events::{
    store::{EventStore, PurchaseProcessEvent},
    Event, EventSender, PurchaseProcessed,
};
use crate::metrics::GatewayMetrics;
use crate::models::{
    values::{Bin, Email, Ip, LastFour, Zip},
    Biller, BillerName, CaptchaStep, Cascade, CascadeError, FraudAdvice, IllegalStateTransition,
    InitializedItem, PurchaseProcess, PurchaseProcessError, PurchaseProcessState, SessionId,
    StateAction, Transaction, TransactionState,
};

use super::{
    bin_routing::{BinRoutingAdapter, BinRoutingCodeCollection, BinRoutingRequest},
    biller::{BillerRegistry, ChargeRequest, PaymentInstrument, RedirectRequest, ThreeDCompletion},
    fraud_recommendation::{
        FraudDataFields, FraudEvent, FraudRecommendationAdapter, FraudRecommendationRequest,
    },
    payment_template::{PaymentTemplate, PaymentTemplateAdapter},
};

fn default_payment_type() -> String {
    "cc".to_string()
}

fn validate_amount(amount: &Decimal) -> Result<(), ValidationError> {
    if amount.is_sign_negative() || amount.is_zero() {
        let mut err = ValidationError::new("amount");
        err.message = Some("amount must be greater than zero".into());
        return Err(err);
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CrossSaleOffer {
    /// Defaults to the main item's site
    #[serde(default)]
    pub site_id: Option<Uuid>,
    #[validate(custom = "validate_amount")]
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InitPurchaseRequest {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub public_key_index: u32,
    pub business_group_id: Uuid,
    pub site_id: Uuid,
    #[serde(default)]
    pub member_id: Option<Uuid>,
    #[validate(custom = "validate_amount")]
    pub amount: Decimal,
    #[serde(default)]
    #[validate]
    pub cross_sales: Vec<CrossSaleOffer>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default = "default_payment_type")]
    #[validate(length(min = 1, message = "Payment type is required"))]
    pub payment_type: String,
    /// Overrides the configured cascade for this purchase
    #[serde(default)]
    pub cascade: Option<Vec<CascadeEntry>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitPurchaseResult {
    pub session_id: SessionId,
    pub state: PurchaseProcessState,
    pub main_item_id: Uuid,
    pub cross_sale_item_ids: Vec<Uuid>,
    pub payment_templates: Vec<PaymentTemplate>,
    pub captcha_required: bool,
    pub cascade: Vec<BillerName>,
}

/// Payment details as the member submitted them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentMethod {
    Card {
        token: String,
        first_six: String,
        last_four: String,
    },
    Template {
        template_id: Uuid,
        #[serde(default)]
        last_four: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessPurchaseRequest {
    pub session_id: SessionId,
    pub business_group_id: Uuid,
    pub payment: PaymentMethod,
    #[serde(default)]
    pub selected_cross_sales: Vec<Uuid>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompleteThirdPartyRequest {
    pub session_id: SessionId,
    pub outcome: TransactionState,
}

/// What the caller should do or show next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PurchaseOutcome {
    Approved,
    Declined,
    /// Waiting for the biller to report back.
    Pending,
    ReadyToProcess,
    ThreeDSecureRequired { authentication_url: String },
    RedirectRequired { redirect_url: String },
    BlockedDueToFraudAdvice { captcha_required: bool },
    CascadeBillersExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrossSaleResult {
    pub item_id: Uuid,
    pub selected: bool,
    pub state: Option<TransactionState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurchaseResult {
    pub session_id: SessionId,
    pub state: PurchaseProcessState,
    pub outcome: PurchaseOutcome,
    pub biller: Option<BillerName>,
    pub is_third_party: bool,
    pub gateway_submit_number: u32,
    pub transactions: Vec<Transaction>,
    pub cross_sales: Vec<CrossSaleResult>,
}

impl PurchaseResult {
    pub fn from_process(process: &PurchaseProcess) -> Self {
        let biller = process.current_biller().ok();
        let mut cross_sales: Vec<CrossSaleResult> = process
            .cross_sales()
            .map(|item| CrossSaleResult {
                item_id: item.item_id,
                selected: item.is_cross_sale_selected,
                state: item.last_transaction().map(|t| t.state),
            })
            .collect();
        cross_sales.sort_by_key(|item| item.item_id);

        Self {
            session_id: process.session_id(),
            state: process.state(),
            outcome: outcome_of(process),
            biller: biller.map(|b| b.name()),
            is_third_party: biller.map(|b| b.is_third_party()).unwrap_or(false),
            gateway_submit_number: process.gateway_submit_number(),
            transactions: process.main_item().transactions().to_vec(),
            cross_sales,
        }
    }
}

fn outcome_of(process: &PurchaseProcess) -> PurchaseOutcome {
    match process.state() {
        PurchaseProcessState::BlockedDueToFraudAdvice => PurchaseOutcome::BlockedDueToFraudAdvice {
            captcha_required: process
                .fraud_advice()
                .map(|advice| !advice.is_captcha_cleared())
                .unwrap_or(false),
        },
        PurchaseProcessState::CascadeBillersExhausted => PurchaseOutcome::CascadeBillersExhausted,
        PurchaseProcessState::Processed if process.was_main_item_purchase_successful() => {
            PurchaseOutcome::Approved
        }
        PurchaseProcessState::Processed => PurchaseOutcome::Declined,
        _ => match process.main_item().last_transaction() {
            None => PurchaseOutcome::ReadyToProcess,
            Some(t) if t.is_pending() => {
                if let Some(challenge) = &t.three_d {
                    PurchaseOutcome::ThreeDSecureRequired {
                        authentication_url: challenge.authentication_url.clone(),
                    }
                } else if let Some(url) = &t.redirect_url {
                    PurchaseOutcome::RedirectRequired {
                        redirect_url: url.clone(),
                    }
                } else {
                    PurchaseOutcome::Pending
                }
            }
            Some(t) if t.is_approved() => PurchaseOutcome::Approved,
            Some(_) => PurchaseOutcome::Declined,
        },
    }
}

/// Orchestrates purchases over the event-sourced [`PurchaseProcess`].
#[derive(Clone)]
pub struct PurchaseService {
    store: Arc<dyn EventStore>,
    fraud: FraudRecommendationAdapter,
    templates: PaymentTemplateAdapter,
    bin_routing: BinRoutingAdapter,
    billers: Arc<BillerRegistry>,
    default_cascade: Vec<Biller>,
    event_sender: Option<Arc<EventSender>>,
    metrics: GatewayMetrics,
}

impl PurchaseService {
    pub fn new(
        store: Arc<dyn EventStore>,
        fraud: FraudRecommendationAdapter,
        templates: PaymentTemplateAdapter,
        bin_routing: BinRoutingAdapter,
        billers: Arc<BillerRegistry>,
        default_cascade: Vec<Biller>,
    ) -> Self {
        Self {
            store,
            fraud,
            templates,
            bin_routing,
            billers,
            default_cascade,
            event_sender: None,
            metrics: GatewayMetrics::default(),
        }
    }

    pub fn with_event_sender(mut self, event_sender: Arc<EventSender>) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }

    /// Starts a purchase: screens the member, lists stored cards and settles
    /// the initial state from the fraud advice.
    #[instrument(skip(self, request), fields(site_id = %request.site_id))]
    pub async fn init_purchase(
        &self,
        request: InitPurchaseRequest,
    ) -> Result<InitPurchaseResult, ServiceError> {
        request.validate()?;

        let ip = request.ip.as_deref().map(Ip::parse).transpose()?;
        let email = request.email.as_deref().map(Email::parse).transpose()?;
        let zip = request.zip.as_deref().map(Zip::parse).transpose()?;
        let session_id = request.session_id.unwrap_or_default();

        let billers = match &request.cascade {
            Some(entries) => entries
                .iter()
                .map(CascadeEntry::to_biller)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ServiceError::ValidationError(e.to_string()))?,
            None => self.default_cascade.clone(),
        };
        let cascade = Cascade::new(billers)?;

        let main_item = InitializedItem::main(request.site_id, request.amount);
        let cross_sales: Vec<InitializedItem> = request
            .cross_sales
            .iter()
            .map(|offer| {
                InitializedItem::cross_sale(offer.site_id.unwrap_or(request.site_id), offer.amount)
            })
            .collect();

        let fraud_request = FraudRecommendationRequest {
            business_group_id: request.business_group_id,
            site_id: request.site_id,
            event: FraudEvent::InitCustomer,
            data: FraudDataFields {
                ip: ip.clone(),
                email: email.clone(),
                zip: zip.clone(),
                bin: None,
                amount: Some(request.amount),
                country: request.country.clone(),
            },
            session_id,
        };
        let templates = async {
            match request.member_id {
                Some(member_id) => {
                    self.templates
                        .retrieve_all(member_id, &request.payment_type, session_id)
                        .await
                }
                None => Vec::new(),
            }
        };
        let (recommendations, payment_templates) =
            tokio::join!(self.fraud.retrieve(fraud_request), templates);

        let captcha_advised = recommendations.is_blocked() && recommendations.requires_captcha();
        let mut advice = FraudAdvice::new(ip, email, zip, None, recommendations);
        if captcha_advised {
            advice.mark_init_captcha_advised();
        }

        let mut process = PurchaseProcess::create(
            session_id,
            request.public_key_index,
            main_item,
            cross_sales,
        );
        process.set_fraud_advice(advice)?;
        process.init_state_according_to_fraud_advice()?;
        process.set_cascade(cascade)?;
        self.persist(&mut process, false).await?;

        self.metrics.purchases_initialized.inc();
        if process.is_fraud_blocked() {
            self.metrics.purchases_blocked.inc();
        }
        self.publish(Event::PurchaseInitialized {
            session_id,
            state: process.state(),
        })
        .await;

        info!(%session_id, state = %process.state(), "purchase initialized");

        let mut cross_sale_item_ids: Vec<Uuid> =
            process.cross_sales().map(|item| item.item_id).collect();
        cross_sale_item_ids.sort();

        Ok(InitPurchaseResult {
            session_id,
            state: process.state(),
            main_item_id: process.main_item().item_id,
            cross_sale_item_ids,
            payment_templates,
            captcha_required: captcha_advised,
            cascade: process
                .cascade()
                .map(|c| c.billers().iter().map(|b| b.name()).collect())
                .unwrap_or_default(),
        })
    }

    /// Charges the purchase, walking the cascade until a biller settles it or
    /// the member has to act (3-D Secure, redirect, captcha).
    #[instrument(skip(self, request), fields(session_id = %request.session_id))]
    pub async fn process_purchase(
        &self,
        request: ProcessPurchaseRequest,
    ) -> Result<PurchaseResult, ServiceError> {
        let mut process = self.load(request.session_id).await?;
        let was_terminal = process.state().is_terminal();

        if process.is_fraud_blocked() {
            info!("purchase is blocked by fraud advice, nothing submitted");
            return Ok(PurchaseResult::from_process(&process));
        }
        // fail before touching any dependency when the process cannot be charged
        process.state().start_processing()?;

        let payment = self.resolve_payment(&process, &request).await?;

        for item_id in &request.selected_cross_sales {
            let selected = process
                .item(*item_id)
                .map(|item| item.is_cross_sale_selected)
                .unwrap_or(false);
            if !selected {
                process.select_cross_sale(*item_id)?;
            }
        }
        process.attach_payment(payment.clone())?;

        // the first attempt's routing does not depend on the screen's answer
        let first_routing = first_routing_request(&process, &request, &payment);
        let (screened, mut routing) = tokio::join!(
            self.screen_on_process(&mut process, &request, payment.first_six()),
            self.prefetch_routing(first_routing),
        );
        screened?;
        if !process.is_fraud_blocked() {
            self.run_cascade(&mut process, &request, &payment, &mut routing)
                .await?;
            self.charge_cross_sales(&mut process, Some(&payment)).await?;
        }

        self.persist(&mut process, was_terminal).await?;
        Ok(PurchaseResult::from_process(&process))
    }

    /// Finishes a 3-D Secure challenge started by [`process_purchase`](Self::process_purchase).
    #[instrument(skip(self, pares))]
    pub async fn complete_three_d(
        &self,
        session_id: SessionId,
        pares: String,
    ) -> Result<PurchaseResult, ServiceError> {
        let mut process = self.load(session_id).await?;
        let was_terminal = process.state().is_terminal();

        process.authenticate_three_d()?;
        let biller = process.current_biller()?;
        let item_id = process.main_item().item_id;
        let submit_number = cascade_submit_number(&process);

        let completion = ThreeDCompletion {
            session_id,
            item_id,
            biller: biller.name(),
            pares,
        };
        let transaction = match self.billers.complete_three_d(&completion).await {
            Ok(outcome) => outcome.into_transaction(biller.name(), submit_number),
            Err(e) => {
                warn!(error = %e, biller = %biller.name(), "3-D Secure completion failed, recording aborted transaction");
                Transaction::aborted(biller.name(), submit_number)
            }
        };
        self.metrics
            .record_charge(biller.name().as_ref(), &transaction.state.to_string());
        process.add_transaction(item_id, transaction)?;
        process.post_processing()?;
        let payment = process.payment().cloned();
        self.charge_cross_sales(&mut process, payment.as_ref()).await?;

        self.persist(&mut process, was_terminal).await?;
        Ok(PurchaseResult::from_process(&process))
    }

    /// Records what a third-party biller reported after the member came back.
    #[instrument(skip(self, request), fields(session_id = %request.session_id, outcome = %request.outcome))]
    pub async fn complete_third_party(
        &self,
        request: CompleteThirdPartyRequest,
    ) -> Result<PurchaseResult, ServiceError> {
        if request.outcome == TransactionState::Pending {
            return Err(ServiceError::ValidationError(
                "a biller postback must settle the transaction".to_string(),
            ));
        }

        let mut process = self.load(request.session_id).await?;
        let was_terminal = process.state().is_terminal();

        let awaiting_three_d = process
            .main_item()
            .last_transaction()
            .map(|t| t.three_d.is_some())
            .unwrap_or(false);
        let from = process.state();
        if !matches!(
            from,
            PurchaseProcessState::Pending | PurchaseProcessState::Redirected
        ) || awaiting_three_d
        {
            return Err(IllegalStateTransition::Action {
                from,
                action: StateAction::FinishProcessing,
            }
            .into());
        }

        let biller = process.current_biller()?;
        let item_id = process.main_item().item_id;
        let transaction =
            Transaction::new(biller.name(), request.outcome, cascade_submit_number(&process));
        self.metrics
            .record_charge(biller.name().as_ref(), &transaction.state.to_string());
        process.add_transaction(item_id, transaction)?;
        process.post_processing()?;
        let payment = process.payment().cloned();
        self.charge_cross_sales(&mut process, payment.as_ref()).await?;

        self.persist(&mut process, was_terminal).await?;
        Ok(PurchaseResult::from_process(&process))
    }

    /// Answers a captcha challenge; clearing every advised challenge unblocks the purchase.
    #[instrument(skip(self))]
    pub async fn validate_captcha(
        &self,
        session_id: SessionId,
        step: CaptchaStep,
    ) -> Result<PurchaseResult, ServiceError> {
        let mut process = self.load(session_id).await?;
        let was_terminal = process.state().is_terminal();

        process.validate_captcha(step)?;
        self.metrics.captchas_validated.inc();

        self.persist(&mut process, was_terminal).await?;
        Ok(PurchaseResult::from_process(&process))
    }

    /// Current view of a purchase without changing it.
    pub async fn purchase(&self, session_id: SessionId) -> Result<PurchaseResult, ServiceError> {
        let process = self.load(session_id).await?;
        Ok(PurchaseResult::from_process(&process))
    }

    async fn load(&self, session_id: SessionId) -> Result<PurchaseProcess, ServiceError> {
        let log = self.store.load(session_id).await?;
        if log.is_empty() {
            return Err(ServiceError::SessionNotFound(session_id));
        }
        let events: Vec<PurchaseProcessEvent> = log.into_iter().map(|r| r.event).collect();
        PurchaseProcess::restore(&events).map_err(|e| {
            error!(%session_id, error = %e, "failed to restore purchase process");
            ServiceError::from(e)
        })
    }

    /// Appends pending events and publishes the outcome the first time the
    /// process settles.
    async fn persist(
        &self,
        process: &mut PurchaseProcess,
        was_terminal: bool,
    ) -> Result<(), ServiceError> {
        if process.has_uncommitted_events() {
            let (expected_version, events) = process.take_uncommitted_events();
            self.store
                .append(process.session_id(), expected_version, events)
                .await?;
        }

        if !was_terminal && process.state().is_terminal() {
            self.metrics.purchases_processed.inc();
            if process.was_main_item_purchase_successful() {
                self.metrics.purchases_approved.inc();
            }
            if process.state() == PurchaseProcessState::CascadeBillersExhausted {
                self.metrics.cascades_exhausted.inc();
            }
            self.publish(Event::PurchaseProcessed(Box::new(
                PurchaseProcessed::from_process(process),
            )))
            .await;
        }
        Ok(())
    }

    async fn publish(&self, event: Event) {
        if let Some(event_sender) = &self.event_sender {
            let session_id = event.session_id();
            if let Err(e) = event_sender.send(event).await {
                warn!(error = %e, %session_id, "Failed to send purchase event");
            }
        }
    }

    async fn resolve_payment(
        &self,
        process: &PurchaseProcess,
        request: &ProcessPurchaseRequest,
    ) -> Result<PaymentInstrument, ServiceError> {
        match &request.payment {
            PaymentMethod::Card {
                token,
                first_six,
                last_four,
            } => Ok(PaymentInstrument::Card {
                token: token.clone(),
                first_six: Bin::parse(first_six)?,
                last_four: LastFour::parse(last_four)?,
            }),
            PaymentMethod::Template {
                template_id,
                last_four,
            } => {
                let bypass = process
                    .fraud_advice()
                    .map(FraudAdvice::has_bypass_payment_template_validation)
                    .unwrap_or(false);
                let template = match (bypass, last_four) {
                    (true, _) => {
                        self.templates
                            .retrieve(*template_id, request.session_id)
                            .await?
                    }
                    (false, Some(last_four)) => {
                        self.templates
                            .validate(*template_id, last_four, request.session_id)
                            .await?
                    }
                    (false, None) => {
                        return Err(ServiceError::ValidationError(
                            "last four digits are required to pay with a stored card".to_string(),
                        ))
                    }
                };
                Ok(PaymentInstrument::Template {
                    template_id: template.template_id,
                    first_six: template.first_six,
                })
            }
        }
    }

    /// Screens the member again with the card in hand. Runs once per purchase.
    async fn screen_on_process(
        &self,
        process: &mut PurchaseProcess,
        request: &ProcessPurchaseRequest,
        first_six: &Bin,
    ) -> Result<(), ServiceError> {
        let mut advice = process
            .fraud_advice()
            .cloned()
            .ok_or(PurchaseProcessError::MissingFraudAdvice(process.session_id()))?;
        if advice.has_process_screening() {
            return Ok(());
        }

        let main_item = process.main_item();
        let fraud_request = FraudRecommendationRequest {
            business_group_id: request.business_group_id,
            site_id: main_item.site_id,
            event: FraudEvent::ProcessCustomer,
            data: FraudDataFields {
                ip: advice.ip().copied(),
                email: advice.email().cloned(),
                zip: advice.zip().cloned(),
                bin: Some(first_six.clone()),
                amount: Some(main_item.amount),
                country: request.country.clone(),
            },
            session_id: process.session_id(),
        };
        let recommendations = self.fraud.retrieve(fraud_request).await;
        let captcha = recommendations.requires_captcha();
        advice.attach_process_recommendations(Some(first_six.clone()), recommendations);

        let blocked = advice.is_blocked_on_process();
        if blocked && captcha {
            advice.mark_process_captcha_advised();
        }
        process.set_fraud_advice(advice)?;
        if blocked {
            info!(session_id = %process.session_id(), captcha, "purchase blocked by process-time fraud advice");
            process.block_due_to_fraud_advice()?;
            self.metrics.purchases_blocked.inc();
        }
        Ok(())
    }

    async fn prefetch_routing(
        &self,
        request: Option<BinRoutingRequest>,
    ) -> Option<BinRoutingCodeCollection> {
        match request {
            Some(request) => Some(self.bin_routing.retrieve(request).await),
            None => None,
        }
    }

    /// Submits the main item biller by biller until the process leaves `Valid`.
    async fn run_cascade(
        &self,
        process: &mut PurchaseProcess,
        request: &ProcessPurchaseRequest,
        payment: &PaymentInstrument,
        first_routing: &mut Option<BinRoutingCodeCollection>,
    ) -> Result<(), ServiceError> {
        while process.state() == PurchaseProcessState::Valid {
            let biller = if process.gateway_submit_number() == 0 {
                process.current_biller()?
            } else {
                match process.next_biller() {
                    Ok(biller) => {
                        self.metrics.cascade_advances.inc();
                        info!(
                            biller = %biller.name(),
                            submit_number = cascade_submit_number(process),
                            "cascade advanced"
                        );
                        biller
                    }
                    Err(PurchaseProcessError::Cascade(CascadeError::InvalidNextBiller)) => {
                        warn!(session_id = %process.session_id(), "no more billers available in the cascade");
                        process.no_more_billers_available()?;
                        return Ok(());
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            if biller.is_third_party() {
                self.start_third_party(process, request, biller).await?;
            } else {
                self.submit_charge(process, request, payment, biller, first_routing.take())
                    .await?;
            }
        }
        Ok(())
    }

    async fn start_third_party(
        &self,
        process: &mut PurchaseProcess,
        request: &ProcessPurchaseRequest,
        biller: Biller,
    ) -> Result<(), ServiceError> {
        if process.gateway_submit_number() == 0 {
            process.redirect()?;
        } else {
            process.set_state_if_third_party()?;
        }
        process.increment_gateway_submit_number()?;

        let main_item = process.main_item();
        let item_id = main_item.item_id;
        let redirect = RedirectRequest {
            session_id: process.session_id(),
            item_id,
            biller: biller.name(),
            amount: main_item.amount,
            return_url: request.return_url.clone(),
        };
        let submit_number = cascade_submit_number(process);

        match self.billers.start_redirect(&redirect).await {
            Ok(instructions) => {
                let mut transaction =
                    Transaction::new(biller.name(), TransactionState::Pending, submit_number);
                transaction.redirect_url = Some(instructions.redirect_url);
                process.add_transaction(item_id, transaction)?;
            }
            Err(e) => {
                warn!(error = %e, biller = %biller.name(), "redirect could not be started, recording aborted transaction");
                process.add_transaction(item_id, Transaction::aborted(biller.name(), submit_number))?;
                process.post_processing()?;
            }
        }
        Ok(())
    }

    async fn submit_charge(
        &self,
        process: &mut PurchaseProcess,
        request: &ProcessPurchaseRequest,
        payment: &PaymentInstrument,
        biller: Biller,
        prefetched: Option<BinRoutingCodeCollection>,
    ) -> Result<(), ServiceError> {
        process.start_processing()?;
        let gateway_submit_number = process.increment_gateway_submit_number()?;
        let submit_number = cascade_submit_number(process);
        let (item_id, site_id, amount) = {
            let item = process.main_item();
            (item.item_id, item.site_id, item.amount)
        };

        let routing = match prefetched {
            Some(routing) => routing,
            None => {
                self.bin_routing
                    .retrieve(BinRoutingRequest {
                        item_id,
                        first_six: payment.first_six().clone(),
                        site_id,
                        biller_name: biller.name(),
                        attempt: gateway_submit_number,
                        business_group_id: request.business_group_id,
                        session_id: process.session_id(),
                    })
                    .await
            }
        };
        let use_three_d = process.is_force_three_d() && biller.name().supports_three_d();

        let charge = ChargeRequest {
            session_id: process.session_id(),
            item_id,
            biller: biller.name(),
            amount,
            submit_number: gateway_submit_number,
            payment: payment.clone(),
            routing_code: routing
                .get(item_id, gateway_submit_number)
                .map(|code| code.routing_code.clone()),
            use_three_d,
        };
        let transaction = match self.billers.charge(&charge).await {
            Ok(outcome) => {
                if let Some(reason) = &outcome.decline_reason {
                    info!(biller = %biller.name(), reason = %reason, "charge declined");
                }
                outcome.into_transaction(biller.name(), submit_number)
            }
            Err(e) => {
                warn!(error = %e, biller = %biller.name(), "charge failed, recording aborted transaction");
                Transaction::aborted(biller.name(), submit_number)
            }
        };
        self.metrics
            .record_charge(biller.name().as_ref(), &transaction.state.to_string());

        let state = transaction.state;
        process.add_transaction(item_id, transaction)?;

        if state == TransactionState::Pending {
            // 3-D Secure challenge or an asynchronous biller answer
            process.start_pending()?;
            return Ok(());
        }
        if use_three_d {
            process.start_pending()?;
            process.perform_three_d_lookup()?;
        }
        process.post_processing()?;
        Ok(())
    }

    /// Charges selected cross-sales with the biller that approved the main item.
    ///
    /// A third-party biller only ever saw the main item's amount, and without
    /// a stored instrument there is nothing to charge. In both cases each
    /// selected cross-sale gets an aborted transaction instead of being left
    /// without an answer.
    async fn charge_cross_sales(
        &self,
        process: &mut PurchaseProcess,
        payment: Option<&PaymentInstrument>,
    ) -> Result<(), ServiceError> {
        if process.state() != PurchaseProcessState::Processed
            || !process.was_main_item_purchase_successful()
        {
            return Ok(());
        }
        let biller = process.current_biller()?;

        let pending: Vec<(Uuid, Decimal)> = process
            .selected_cross_sales()
            .into_iter()
            .filter(|item| !item.was_successful())
            .map(|item| (item.item_id, item.amount))
            .collect();

        let payment = match payment {
            Some(payment) if !biller.is_third_party() => payment,
            _ => {
                for (item_id, _) in pending {
                    warn!(%item_id, biller = %biller.name(), "cross-sale cannot be charged with this biller, recording aborted transaction");
                    process.add_transaction(item_id, Transaction::aborted(biller.name(), 0))?;
                }
                return Ok(());
            }
        };

        for (item_id, amount) in pending {
            let gateway_submit_number = process.increment_gateway_submit_number()?;
            let charge = ChargeRequest {
                session_id: process.session_id(),
                item_id,
                biller: biller.name(),
                amount,
                submit_number: gateway_submit_number,
                payment: payment.clone(),
                routing_code: None,
                use_three_d: false,
            };
            let transaction = match self.billers.charge(&charge).await {
                Ok(outcome) => outcome.into_transaction(biller.name(), 0),
                Err(e) => {
                    warn!(error = %e, %item_id, "cross-sale charge failed");
                    Transaction::aborted(biller.name(), 0)
                }
            };
            self.metrics
                .record_charge(biller.name().as_ref(), &transaction.state.to_string());
            process.add_transaction(item_id, transaction)?;
        }
        Ok(())
    }
}

/// Routing lookup for the first charge, when the cascade starts with a biller
/// that takes the card directly.
fn first_routing_request(
    process: &PurchaseProcess,
    request: &ProcessPurchaseRequest,
    payment: &PaymentInstrument,
) -> Option<BinRoutingRequest> {
    if process.gateway_submit_number() != 0 {
        return None;
    }
    let biller = process.current_biller().ok()?;
    if biller.is_third_party() {
        return None;
    }
    let main_item = process.main_item();
    Some(BinRoutingRequest {
        item_id: main_item.item_id,
        first_six: payment.first_six().clone(),
        site_id: main_item.site_id,
        biller_name: biller.name(),
        attempt: 1,
        business_group_id: request.business_group_id,
        session_id: process.session_id(),
    })
}

fn cascade_submit_number(process: &PurchaseProcess) -> u32 {
    process.cascade().map(Cascade::submit_number).unwrap_or(0)
}
