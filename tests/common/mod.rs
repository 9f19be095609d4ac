#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use purchase_gateway::{
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry, InMemoryKillSwitch},
    commands::CommandExecutor,
    events::{
        store::{EventStore, InMemoryEventStore, PurchaseProcessEvent},
        Event, EventSender,
    },
    metrics::GatewayMetrics,
    models::{
        fraud_advice::codes, values::LastFour, Biller, BillerName, FraudRecommendation,
        PurchaseProcess, SessionId,
    },
    services::{
        bin_routing::{
            BinRoutingAdapter, BinRoutingCode, BinRoutingError, BinRoutingRequest,
            BinRoutingServiceClient,
        },
        biller::{BillerGateway, BillerRegistry, SimulatedBillerGateway},
        fraud_recommendation::{
            FraudEvent, FraudRecommendationAdapter, FraudRecommendationError,
            FraudRecommendationRequest, FraudServiceClient,
        },
        payment_template::{
            PaymentTemplate, PaymentTemplateAdapter, PaymentTemplateError,
            PaymentTemplateServiceClient,
        },
        purchase::{CrossSaleOffer, InitPurchaseRequest, PaymentMethod, ProcessPurchaseRequest},
    },
    PurchaseService,
};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use uuid::Uuid;

pub const CALL_TIMEOUT: Duration = Duration::from_millis(200);

pub fn allow() -> FraudRecommendation {
    FraudRecommendation::default_allow()
}

pub fn block() -> FraudRecommendation {
    FraudRecommendation::new(codes::BLOCK, "Block", "Blacklisted")
}

pub fn captcha() -> FraudRecommendation {
    FraudRecommendation::new(codes::CAPTCHA, "Block", "Captcha")
}

pub fn force_three_d() -> FraudRecommendation {
    FraudRecommendation::new(codes::FORCE_THREE_D, "Allow", "Force 3DS")
}

pub fn bypass_template_validation() -> FraudRecommendation {
    FraudRecommendation::new(
        codes::BYPASS_PAYMENT_TEMPLATE_VALIDATION,
        "Allow",
        "Bypass payment template validation",
    )
}

/// How the fake fraud service answers.
#[derive(Clone)]
pub enum FraudBehaviour {
    Script {
        init: Vec<FraudRecommendation>,
        process: Vec<FraudRecommendation>,
    },
    Failing,
    Hanging,
}

pub struct FakeFraudService {
    behaviour: FraudBehaviour,
    calls: AtomicU32,
    events: Mutex<Vec<FraudEvent>>,
}

impl FakeFraudService {
    pub fn new(behaviour: FraudBehaviour) -> Self {
        Self {
            behaviour,
            calls: AtomicU32::new(0),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<FraudEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl FraudServiceClient for FakeFraudService {
    async fn retrieve(
        &self,
        request: &FraudRecommendationRequest,
    ) -> Result<Vec<FraudRecommendation>, FraudRecommendationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(request.event);
        match &self.behaviour {
            FraudBehaviour::Script { init, process } => Ok(match request.event {
                FraudEvent::InitCustomer => init.clone(),
                FraudEvent::ProcessCustomer => process.clone(),
            }),
            FraudBehaviour::Failing => Err(FraudRecommendationError::Api { status: 500 }),
            FraudBehaviour::Hanging => {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![block()])
            }
        }
    }
}

#[derive(Default)]
pub struct FakeTemplateService {
    templates: Vec<PaymentTemplate>,
    down: bool,
    validations: AtomicU32,
    retrievals: AtomicU32,
}

impl FakeTemplateService {
    pub fn with_templates(templates: Vec<PaymentTemplate>) -> Self {
        Self {
            templates,
            ..Self::default()
        }
    }

    pub fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub fn validations(&self) -> u32 {
        self.validations.load(Ordering::SeqCst)
    }

    pub fn retrievals(&self) -> u32 {
        self.retrievals.load(Ordering::SeqCst)
    }

    fn find(&self, template_id: Uuid) -> Result<PaymentTemplate, PaymentTemplateError> {
        if self.down {
            return Err(PaymentTemplateError::Transport("connection refused".into()));
        }
        self.templates
            .iter()
            .find(|t| t.template_id == template_id)
            .cloned()
            .ok_or(PaymentTemplateError::NotFound(template_id))
    }
}

#[async_trait]
impl PaymentTemplateServiceClient for FakeTemplateService {
    async fn retrieve_all(
        &self,
        member_id: Uuid,
        _payment_type: &str,
        _session_id: SessionId,
    ) -> Result<Vec<PaymentTemplate>, PaymentTemplateError> {
        if self.down {
            return Err(PaymentTemplateError::Transport("connection refused".into()));
        }
        Ok(self
            .templates
            .iter()
            .filter(|t| t.member_id == member_id)
            .cloned()
            .collect())
    }

    async fn retrieve(
        &self,
        template_id: Uuid,
        _session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.retrievals.fetch_add(1, Ordering::SeqCst);
        self.find(template_id)
    }

    async fn validate(
        &self,
        template_id: Uuid,
        last_four: &LastFour,
        _session_id: SessionId,
    ) -> Result<PaymentTemplate, PaymentTemplateError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        let template = self.find(template_id)?;
        if template.last_four != *last_four {
            return Err(PaymentTemplateError::ValidationFailed(template_id));
        }
        Ok(template)
    }
}

/// Answers every lookup with the same codes, or fails when `down`.
#[derive(Default)]
pub struct FakeBinRouting {
    codes: Vec<BinRoutingCode>,
    down: bool,
    requests: Mutex<Vec<BinRoutingRequest>>,
}

impl FakeBinRouting {
    pub fn with_codes(codes: Vec<BinRoutingCode>) -> Self {
        Self {
            codes,
            ..Self::default()
        }
    }

    pub fn down() -> Self {
        Self {
            down: true,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<BinRoutingRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl BinRoutingServiceClient for FakeBinRouting {
    async fn retrieve(
        &self,
        request: &BinRoutingRequest,
    ) -> Result<Vec<BinRoutingCode>, BinRoutingError> {
        self.requests.lock().unwrap().push(request.clone());
        if self.down {
            return Err(BinRoutingError::Api { status: 503 });
        }
        Ok(self.codes.clone())
    }
}

pub struct HarnessBuilder {
    fraud: FraudBehaviour,
    templates: FakeTemplateService,
    routing: FakeBinRouting,
    cascade: Vec<Biller>,
    gateways: Vec<SimulatedBillerGateway>,
    overrides: Vec<Arc<dyn BillerGateway>>,
    biller_timeout: Duration,
    breaker_config: CircuitBreakerConfig,
}

impl HarnessBuilder {
    pub fn fraud(mut self, init: Vec<FraudRecommendation>, process: Vec<FraudRecommendation>) -> Self {
        self.fraud = FraudBehaviour::Script { init, process };
        self
    }

    pub fn fraud_behaviour(mut self, behaviour: FraudBehaviour) -> Self {
        self.fraud = behaviour;
        self
    }

    pub fn templates(mut self, templates: FakeTemplateService) -> Self {
        self.templates = templates;
        self
    }

    pub fn routing(mut self, routing: FakeBinRouting) -> Self {
        self.routing = routing;
        self
    }

    pub fn cascade(mut self, cascade: Vec<Biller>) -> Self {
        self.cascade = cascade;
        self
    }

    /// Replaces the approve-everything gateway of the same biller.
    pub fn gateway(mut self, gateway: SimulatedBillerGateway) -> Self {
        self.gateways.push(gateway);
        self
    }

    /// Registers any gateway in place of the simulated one for its biller.
    pub fn gateway_override(mut self, gateway: Arc<dyn BillerGateway>) -> Self {
        self.overrides.push(gateway);
        self
    }

    pub fn biller_timeout(mut self, timeout: Duration) -> Self {
        self.biller_timeout = timeout;
        self
    }

    pub fn breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    pub fn build(self) -> Harness {
        let metrics = GatewayMetrics::default();
        let kill_switch = Arc::new(InMemoryKillSwitch::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(
            self.breaker_config,
            kill_switch.clone(),
        ));
        let executor =
            CommandExecutor::new(breakers.clone(), CALL_TIMEOUT).with_metrics(metrics.clone());

        let mut gateways: HashMap<BillerName, Arc<SimulatedBillerGateway>> = HashMap::new();
        for name in [
            BillerName::Rocketgate,
            BillerName::Netbilling,
            BillerName::Epoch,
            BillerName::Qysso,
        ] {
            gateways.insert(name, Arc::new(SimulatedBillerGateway::new(name)));
        }
        for gateway in self.gateways {
            gateways.insert(gateway.name(), Arc::new(gateway));
        }
        let mut billers = BillerRegistry::new(self.biller_timeout);
        for gateway in gateways.values() {
            billers.register(gateway.clone());
        }
        for gateway in self.overrides {
            billers.register(gateway);
        }

        let fraud = Arc::new(FakeFraudService::new(self.fraud));
        let templates = Arc::new(self.templates);
        let routing = Arc::new(self.routing);
        let store = Arc::new(InMemoryEventStore::new());
        let (sender, events) = EventSender::channel(64);

        let service = PurchaseService::new(
            store.clone(),
            FraudRecommendationAdapter::new(fraud.clone(), executor.clone()),
            PaymentTemplateAdapter::new(templates.clone(), executor.clone()),
            BinRoutingAdapter::new(routing.clone(), executor),
            Arc::new(billers),
            self.cascade,
        )
        .with_metrics(metrics.clone())
        .with_event_sender(Arc::new(sender));

        Harness {
            service,
            store,
            metrics,
            breakers,
            kill_switch,
            fraud,
            templates,
            routing,
            gateways,
            events,
        }
    }
}

pub struct Harness {
    pub service: PurchaseService,
    pub store: Arc<InMemoryEventStore>,
    pub metrics: GatewayMetrics,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub kill_switch: Arc<InMemoryKillSwitch>,
    pub fraud: Arc<FakeFraudService>,
    pub templates: Arc<FakeTemplateService>,
    pub routing: Arc<FakeBinRouting>,
    pub gateways: HashMap<BillerName, Arc<SimulatedBillerGateway>>,
    events: mpsc::Receiver<Event>,
}

impl Harness {
    /// Allow-everything fraud, no stored cards, Rocketgate then Netbilling.
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder {
            fraud: FraudBehaviour::Script {
                init: vec![allow()],
                process: vec![allow()],
            },
            templates: FakeTemplateService::default(),
            routing: FakeBinRouting::default(),
            cascade: vec![
                Biller::with_defaults(BillerName::Rocketgate),
                Biller::with_defaults(BillerName::Netbilling),
            ],
            gateways: Vec::new(),
            overrides: Vec::new(),
            biller_timeout: Duration::from_secs(1),
            breaker_config: CircuitBreakerConfig::default(),
        }
    }

    pub fn gateway(&self, name: BillerName) -> &Arc<SimulatedBillerGateway> {
        &self.gateways[&name]
    }

    /// Domain events published so far.
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn event_log(&self, session_id: SessionId) -> Vec<PurchaseProcessEvent> {
        self.store
            .load(session_id)
            .await
            .unwrap()
            .into_iter()
            .map(|recorded| recorded.event)
            .collect()
    }

    pub async fn replay(&self, session_id: SessionId) -> PurchaseProcess {
        PurchaseProcess::restore(&self.event_log(session_id).await).unwrap()
    }
}

pub fn init_request() -> InitPurchaseRequest {
    InitPurchaseRequest {
        session_id: None,
        public_key_index: 1,
        business_group_id: Uuid::new_v4(),
        site_id: Uuid::new_v4(),
        member_id: None,
        amount: dec!(29.99),
        cross_sales: Vec::new(),
        ip: Some("203.0.113.7".into()),
        email: Some("member@example.com".into()),
        zip: Some("90210".into()),
        country: Some("US".into()),
        payment_type: "cc".into(),
        cascade: None,
    }
}

pub fn with_cross_sale(mut request: InitPurchaseRequest) -> InitPurchaseRequest {
    request.cross_sales.push(CrossSaleOffer {
        site_id: None,
        amount: dec!(9.99),
    });
    request
}

pub fn card() -> PaymentMethod {
    PaymentMethod::Card {
        token: "tok_4111".into(),
        first_six: "411111".into(),
        last_four: "1111".into(),
    }
}

pub fn process_request(session_id: SessionId, payment: PaymentMethod) -> ProcessPurchaseRequest {
    ProcessPurchaseRequest {
        session_id,
        business_group_id: Uuid::new_v4(),
        payment,
        selected_cross_sales: Vec::new(),
        country: Some("US".into()),
        return_url: Some("https://merchant.example.test/return".into()),
    }
}

pub fn stored_card(member_id: Uuid) -> PaymentTemplate {
    serde_json::from_value(serde_json::json!({
        "templateId": Uuid::new_v4(),
        "memberId": member_id,
        "billerName": "rocketgate",
        "firstSix": "411111",
        "lastFour": "1111",
        "expirationMonth": 12,
        "expirationYear": 2030
    }))
    .unwrap()
}
