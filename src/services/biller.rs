//! Biller submission.
//!
//! Each processor is an opaque [`BillerGateway`]. Charges are not guarded by
//! a circuit breaker: a failed or timed-out charge becomes an aborted
//! transaction and the cascade moves on.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

pub use crate::models::values::PaymentInstrument;
use crate::models::{BillerName, SessionId, ThreeDChallenge, Transaction, TransactionState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BillerGatewayError {
    #[error("biller {biller} unavailable: {reason}")]
    Unavailable { biller: BillerName, reason: String },
    #[error("biller {biller} rejected the request: {reason}")]
    Rejected { biller: BillerName, reason: String },
    #[error("biller {biller} did not answer within {timeout:?}")]
    Timeout { biller: BillerName, timeout: Duration },
    #[error("no gateway configured for biller {0}")]
    NotConfigured(BillerName),
    #[error("biller {biller} does not support {operation}")]
    Unsupported {
        biller: BillerName,
        operation: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChargeRequest {
    pub session_id: SessionId,
    pub item_id: Uuid,
    pub biller: BillerName,
    pub amount: Decimal,
    pub submit_number: u32,
    pub payment: PaymentInstrument,
    pub routing_code: Option<String>,
    pub use_three_d: bool,
}

/// What a biller said about one charge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeOutcome {
    pub state: TransactionState,
    #[serde(default)]
    pub three_d: Option<ThreeDChallenge>,
    #[serde(default)]
    pub is_nsf: bool,
    #[serde(default)]
    pub decline_reason: Option<String>,
}

impl ChargeOutcome {
    pub fn approved() -> Self {
        Self {
            state: TransactionState::Approved,
            three_d: None,
            is_nsf: false,
            decline_reason: None,
        }
    }

    pub fn declined(reason: impl Into<String>) -> Self {
        Self {
            state: TransactionState::Declined,
            decline_reason: Some(reason.into()),
            ..Self::approved()
        }
    }

    pub fn three_d_challenge(authentication_url: impl Into<String>) -> Self {
        Self {
            state: TransactionState::Pending,
            three_d: Some(ThreeDChallenge {
                authentication_url: authentication_url.into(),
                pareq: None,
            }),
            ..Self::approved()
        }
    }

    pub fn into_transaction(self, biller: BillerName, submit_number: u32) -> Transaction {
        let mut transaction = Transaction::new(biller, self.state, submit_number);
        transaction.is_nsf = self.is_nsf;
        transaction.three_d = self.three_d;
        transaction
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedirectRequest {
    pub session_id: SessionId,
    pub item_id: Uuid,
    pub biller: BillerName,
    pub amount: Decimal,
    pub return_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectInstructions {
    pub redirect_url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThreeDCompletion {
    pub session_id: SessionId,
    pub item_id: Uuid,
    pub biller: BillerName,
    pub pares: String,
}

#[async_trait]
pub trait BillerGateway: Send + Sync {
    fn name(&self) -> BillerName;

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, BillerGatewayError>;

    async fn start_redirect(
        &self,
        _request: &RedirectRequest,
    ) -> Result<RedirectInstructions, BillerGatewayError> {
        Err(BillerGatewayError::Unsupported {
            biller: self.name(),
            operation: "redirect",
        })
    }

    async fn complete_three_d(
        &self,
        _request: &ThreeDCompletion,
    ) -> Result<ChargeOutcome, BillerGatewayError> {
        Err(BillerGatewayError::Unsupported {
            biller: self.name(),
            operation: "3-D Secure",
        })
    }
}

/// Gateways by biller, each call bounded by the biller timeout.
#[derive(Clone)]
pub struct BillerRegistry {
    gateways: HashMap<BillerName, Arc<dyn BillerGateway>>,
    timeout: Duration,
}

impl BillerRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            gateways: HashMap::new(),
            timeout,
        }
    }

    pub fn register(&mut self, gateway: Arc<dyn BillerGateway>) {
        self.gateways.insert(gateway.name(), gateway);
    }

    pub fn with_gateway(mut self, gateway: Arc<dyn BillerGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, biller: BillerName) -> Result<&Arc<dyn BillerGateway>, BillerGatewayError> {
        self.gateways
            .get(&biller)
            .ok_or(BillerGatewayError::NotConfigured(biller))
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, biller = %request.biller, submit = request.submit_number))]
    pub async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, BillerGatewayError> {
        let gateway = self.get(request.biller)?;
        let outcome = tokio::time::timeout(self.timeout, gateway.charge(request))
            .await
            .map_err(|_| BillerGatewayError::Timeout {
                biller: request.biller,
                timeout: self.timeout,
            })??;
        info!(state = %outcome.state, three_d = outcome.three_d.is_some(), "biller answered");
        Ok(outcome)
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, biller = %request.biller))]
    pub async fn start_redirect(
        &self,
        request: &RedirectRequest,
    ) -> Result<RedirectInstructions, BillerGatewayError> {
        let gateway = self.get(request.biller)?;
        tokio::time::timeout(self.timeout, gateway.start_redirect(request))
            .await
            .map_err(|_| BillerGatewayError::Timeout {
                biller: request.biller,
                timeout: self.timeout,
            })?
    }

    #[instrument(skip(self, request), fields(session_id = %request.session_id, biller = %request.biller))]
    pub async fn complete_three_d(
        &self,
        request: &ThreeDCompletion,
    ) -> Result<ChargeOutcome, BillerGatewayError> {
        let gateway = self.get(request.biller)?;
        tokio::time::timeout(self.timeout, gateway.complete_three_d(request))
            .await
            .map_err(|_| BillerGatewayError::Timeout {
                biller: request.biller,
                timeout: self.timeout,
            })?
    }
}

impl std::fmt::Debug for BillerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut billers: Vec<&BillerName> = self.gateways.keys().collect();
        billers.sort_by_key(|name| name.as_ref().to_string());
        f.debug_struct("BillerRegistry")
            .field("billers", &billers)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A biller that answers from a script, for dry runs and tests.
///
/// Charges pop the next scripted outcome and approve once the script runs
/// out. 3-D Secure completions have their own script. Third-party billers
/// hand out a redirect under `redirect_base`.
#[derive(Debug)]
pub struct SimulatedBillerGateway {
    name: BillerName,
    charges: Mutex<VecDeque<ChargeOutcome>>,
    three_d_completions: Mutex<VecDeque<ChargeOutcome>>,
    redirect_base: String,
    calls: Mutex<Vec<ChargeRequest>>,
}

impl SimulatedBillerGateway {
    pub fn new(name: BillerName) -> Self {
        Self {
            name,
            charges: Mutex::new(VecDeque::new()),
            three_d_completions: Mutex::new(VecDeque::new()),
            redirect_base: format!("https://{}.example.test/pay", name),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_charges(self, outcomes: impl IntoIterator<Item = ChargeOutcome>) -> Self {
        lock(&self.charges).extend(outcomes);
        self
    }

    pub fn with_three_d_completions(self, outcomes: impl IntoIterator<Item = ChargeOutcome>) -> Self {
        lock(&self.three_d_completions).extend(outcomes);
        self
    }

    pub fn with_redirect_base(mut self, redirect_base: impl Into<String>) -> Self {
        self.redirect_base = redirect_base.into();
        self
    }

    /// Charge requests received so far.
    pub fn charge_requests(&self) -> Vec<ChargeRequest> {
        lock(&self.calls).clone()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl BillerGateway for SimulatedBillerGateway {
    fn name(&self) -> BillerName {
        self.name
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome, BillerGatewayError> {
        lock(&self.calls).push(request.clone());
        let outcome = lock(&self.charges)
            .pop_front()
            .unwrap_or_else(ChargeOutcome::approved);
        if outcome.three_d.is_some() && !request.use_three_d {
            warn!(biller = %self.name, "scripted 3-D Secure challenge on a plain charge, approving");
            return Ok(ChargeOutcome::approved());
        }
        Ok(outcome)
    }

    async fn start_redirect(
        &self,
        request: &RedirectRequest,
    ) -> Result<RedirectInstructions, BillerGatewayError> {
        if !self.name.is_third_party() {
            return Err(BillerGatewayError::Unsupported {
                biller: self.name,
                operation: "redirect",
            });
        }
        Ok(RedirectInstructions {
            redirect_url: format!("{}/{}", self.redirect_base, request.session_id),
        })
    }

    async fn complete_three_d(
        &self,
        _request: &ThreeDCompletion,
    ) -> Result<ChargeOutcome, BillerGatewayError> {
        Ok(lock(&self.three_d_completions)
            .pop_front()
            .unwrap_or_else(ChargeOutcome::approved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::values::{Bin, LastFour};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    struct Stalled;

    #[async_trait]
    impl BillerGateway for Stalled {
        fn name(&self) -> BillerName {
            BillerName::Netbilling
        }

        async fn charge(&self, _request: &ChargeRequest) -> Result<ChargeOutcome, BillerGatewayError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ChargeOutcome::approved())
        }
    }

    fn charge(biller: BillerName) -> ChargeRequest {
        ChargeRequest {
            session_id: SessionId::new(),
            item_id: Uuid::new_v4(),
            biller,
            amount: dec!(9.99),
            submit_number: 1,
            payment: PaymentInstrument::Card {
                token: "tok_123".into(),
                first_six: Bin::parse("411111").unwrap(),
                last_four: LastFour::parse("1111").unwrap(),
            },
            routing_code: None,
            use_three_d: false,
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_are_replayed_in_order() {
        let gateway = Arc::new(
            SimulatedBillerGateway::new(BillerName::Rocketgate)
                .with_charges([ChargeOutcome::declined("insufficient funds")]),
        );
        let registry = BillerRegistry::new(Duration::from_secs(1)).with_gateway(gateway.clone());

        let first = registry.charge(&charge(BillerName::Rocketgate)).await.unwrap();
        assert_eq!(first.state, TransactionState::Declined);
        let second = registry.charge(&charge(BillerName::Rocketgate)).await.unwrap();
        assert_eq!(second.state, TransactionState::Approved);
        assert_eq!(gateway.charge_requests().len(), 2);
    }

    #[tokio::test]
    async fn slow_biller_times_out() {
        let registry = BillerRegistry::new(Duration::from_millis(20)).with_gateway(Arc::new(Stalled));
        assert_matches!(
            registry.charge(&charge(BillerName::Netbilling)).await,
            Err(BillerGatewayError::Timeout { biller: BillerName::Netbilling, .. })
        );
    }

    #[tokio::test]
    async fn unknown_biller_is_not_configured() {
        let registry = BillerRegistry::new(Duration::from_secs(1));
        assert_matches!(
            registry.charge(&charge(BillerName::Epoch)).await,
            Err(BillerGatewayError::NotConfigured(BillerName::Epoch))
        );
    }

    #[tokio::test]
    async fn only_third_party_billers_redirect() {
        let registry = BillerRegistry::new(Duration::from_secs(1))
            .with_gateway(Arc::new(
                SimulatedBillerGateway::new(BillerName::Qysso)
                    .with_redirect_base("https://qysso.test/go"),
            ))
            .with_gateway(Arc::new(Stalled));
        let session_id = SessionId::new();
        let request = |biller| RedirectRequest {
            session_id,
            item_id: Uuid::new_v4(),
            biller,
            amount: dec!(19.99),
            return_url: None,
        };

        let instructions = registry.start_redirect(&request(BillerName::Qysso)).await.unwrap();
        assert_eq!(
            instructions.redirect_url,
            format!("https://qysso.test/go/{}", session_id)
        );
        assert_matches!(
            registry.start_redirect(&request(BillerName::Netbilling)).await,
            Err(BillerGatewayError::Unsupported { operation: "redirect", .. })
        );
    }

    #[test]
    fn outcome_becomes_a_transaction() {
        let transaction = ChargeOutcome::three_d_challenge("https://acs.test/challenge")
            .into_transaction(BillerName::Rocketgate, 2);
        assert_eq!(transaction.state, TransactionState::Pending);
        assert_eq!(transaction.submit_number, 2);
        assert_eq!(
            transaction.three_d.map(|c| c.authentication_url),
            Some("https://acs.test/challenge".to_string())
        );
    }
}
