use std::sync::Arc;
use std::time::Duration;

use crate::{
    circuit_breaker::CircuitBreakerRegistry,
    commands::CommandExecutor,
    config::AppConfig,
    errors::ServiceError,
    events::{
        store::{EventStore, InMemoryEventStore},
        EventSender,
    },
    metrics::GatewayMetrics,
};

use super::{
    bin_routing::{BinRoutingAdapter, BinRoutingServiceClient, HttpBinRoutingServiceClient},
    biller::BillerRegistry,
    fraud_recommendation::{FraudRecommendationAdapter, FraudServiceClient, HttpFraudServiceClient},
    http::JsonHttpClient,
    payment_template::{
        HttpPaymentTemplateServiceClient, PaymentTemplateAdapter, PaymentTemplateServiceClient,
    },
    purchase::PurchaseService,
};

/// Clients for the three guarded dependencies.
#[derive(Clone)]
pub struct DependencyClients {
    pub fraud: Arc<dyn FraudServiceClient>,
    pub payment_templates: Arc<dyn PaymentTemplateServiceClient>,
    pub bin_routing: Arc<dyn BinRoutingServiceClient>,
}

impl DependencyClients {
    /// HTTP clients against the configured service urls.
    pub fn http(config: &AppConfig) -> Result<Self, ServiceError> {
        let client = |url: &str, timeout: Duration| {
            JsonHttpClient::new(url, timeout).map_err(|e| ServiceError::ConfigError(e.to_string()))
        };

        Ok(Self {
            fraud: Arc::new(HttpFraudServiceClient::new(client(
                &config.fraud_service_url,
                config.fraud_timeout(),
            )?)),
            payment_templates: Arc::new(HttpPaymentTemplateServiceClient::new(client(
                &config.payment_template_service_url,
                config.payment_template_timeout(),
            )?)),
            bin_routing: Arc::new(HttpBinRoutingServiceClient::new(client(
                &config.bin_routing_service_url,
                config.bin_routing_timeout(),
            )?)),
        })
    }
}

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    config: AppConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    store: Arc<dyn EventStore>,
    metrics: GatewayMetrics,
    event_sender: Option<EventSender>,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(
        config: AppConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            config,
            breakers,
            store,
            metrics: GatewayMetrics::default(),
            event_sender: None,
        }
    }

    /// Breakers and kill switch as configured, with an in-memory event log.
    pub fn from_config(config: AppConfig) -> Result<Self, ServiceError> {
        let breakers = config
            .breaker_registry()
            .map_err(|e| ServiceError::ConfigError(format!("kill switch: {}", e)))?;
        Ok(Self::new(
            config,
            Arc::new(breakers),
            Arc::new(InMemoryEventStore::new()),
        ))
    }

    pub fn with_event_sender(mut self, event_sender: EventSender) -> Self {
        self.event_sender = Some(event_sender);
        self
    }

    fn executor(&self, timeout: Duration) -> CommandExecutor {
        CommandExecutor::new(self.breakers.clone(), timeout).with_metrics(self.metrics.clone())
    }

    /// Creates the purchase orchestrator over the given clients and billers
    pub fn purchase_service(
        &self,
        clients: DependencyClients,
        billers: BillerRegistry,
    ) -> PurchaseService {
        let service = PurchaseService::new(
            self.store.clone(),
            FraudRecommendationAdapter::new(
                clients.fraud,
                self.executor(self.config.fraud_timeout()),
            ),
            PaymentTemplateAdapter::new(
                clients.payment_templates,
                self.executor(self.config.payment_template_timeout()),
            ),
            BinRoutingAdapter::new(
                clients.bin_routing,
                self.executor(self.config.bin_routing_timeout()),
            ),
            Arc::new(billers),
            self.config.cascade_billers(),
        )
        .with_metrics(self.metrics.clone());

        match &self.event_sender {
            Some(sender) => service.with_event_sender(Arc::new(sender.clone())),
            None => service,
        }
    }

    /// An empty biller registry using the configured biller timeout
    pub fn biller_registry(&self) -> BillerRegistry {
        BillerRegistry::new(self.config.biller_timeout())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn metrics(&self) -> &GatewayMetrics {
        &self.metrics
    }
}
