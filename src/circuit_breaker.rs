/*!
 * # Circuit Breaker Implementation
 *
 * Shared breaker state for every external dependency the gateway calls.
 * One breaker exists per command name and is shared by all concurrent
 * purchases through the [`CircuitBreakerRegistry`]. A breaker trips on the
 * error percentage of a rolling window of outcomes, and an operator can force
 * any command open through a [`KillSwitch`].
 */

use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::ConnectionManager;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, letting trial requests through to test recovery
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes the error percentage is computed over
    pub rolling_window_size: usize,
    /// Minimum outcomes in the window before the breaker may trip
    pub request_volume_threshold: u32,
    /// Error percentage (0-100) at which the circuit opens
    pub error_threshold_percentage: u8,
    /// Duration to wait before transitioning from Open to HalfOpen
    pub sleep_window: Duration,
    /// Number of successful requests needed in HalfOpen to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            rolling_window_size: 20,
            request_volume_threshold: 10,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(5),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    /// `true` for a failure
    window: VecDeque<bool>,
    success_count: u32,
    opened_at: Option<Instant>,
}

impl CircuitBreakerState {
    fn closed(capacity: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(capacity),
            success_count: 0,
            opened_at: None,
        }
    }

    fn failures(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn error_percentage(&self) -> u8 {
        if self.window.is_empty() {
            return 0;
        }
        ((self.failures() * 100) / self.window.len()) as u8
    }
}

/// Circuit breaker for one command
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
    state_transitions: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let capacity = config.rolling_window_size.max(1);
        Self {
            name: name.into(),
            config,
            state: Mutex::new(CircuitBreakerState::closed(capacity)),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            state_transitions: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(), // Recover from poisoned mutex
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        if state.state == to {
            return;
        }
        info!(command = %self.name, from = ?state.state, to = ?to, "circuit breaker state changed");
        state.state = to;
        self.state_transitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Check if the circuit breaker lets a call through. An open circuit
    /// moves to half-open once the sleep window has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let slept = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.sleep_window)
                    .unwrap_or(true);
                if slept {
                    state.success_count = 0;
                    self.transition(&mut state, CircuitState::HalfOpen);
                }
                slept
            }
        }
    }

    fn push_outcome(&self, state: &mut CircuitBreakerState, failed: bool) {
        if state.window.len() >= self.config.rolling_window_size.max(1) {
            state.window.pop_front();
        }
        state.window.push_back(failed);
    }

    fn trip(&self, state: &mut CircuitBreakerState) {
        state.opened_at = Some(Instant::now());
        state.success_count = 0;
        self.transition(state, CircuitState::Open);
    }

    pub fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_successes.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => self.push_outcome(&mut state, false),
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    let capacity = self.config.rolling_window_size.max(1);
                    state.window = VecDeque::with_capacity(capacity);
                    state.success_count = 0;
                    state.opened_at = None;
                    self.transition(&mut state, CircuitState::Closed);
                }
            }
            // a call admitted before the circuit opened
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.total_failures.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        match state.state {
            CircuitState::Closed => {
                self.push_outcome(&mut state, true);
                let volume = state.window.len() as u32;
                let percentage = state.error_percentage();
                if volume >= self.config.request_volume_threshold
                    && percentage >= self.config.error_threshold_percentage
                {
                    warn!(
                        command = %self.name,
                        volume,
                        error_percentage = percentage,
                        "error threshold reached, opening circuit"
                    );
                    self.trip(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                // Go back to open on any failure in half-open state
                warn!(command = %self.name, "trial request failed, reopening circuit");
                self.trip(&mut state);
            }
            CircuitState::Open => {
                state.opened_at = Some(Instant::now());
            }
        }
    }

    /// Counts a call short-circuited without reaching the dependency.
    pub fn record_rejection(&self) {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(command = %self.name, "call short-circuited");
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn error_percentage(&self) -> u8 {
        self.lock().error_percentage()
    }

    pub fn reset(&self) {
        let capacity = self.config.rolling_window_size.max(1);
        let mut state = self.lock();
        *state = CircuitBreakerState::closed(capacity);
    }

    /// Get circuit breaker metrics
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.lock();
        CircuitBreakerMetrics {
            state: state.state,
            window_failures: state.failures() as u32,
            window_size: state.window.len() as u32,
            error_percentage: state.error_percentage(),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            state_transitions: self.state_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Circuit breaker metrics
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub window_failures: u32,
    pub window_size: u32,
    pub error_percentage: u8,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub total_rejections: u64,
    pub state_transitions: u64,
}

impl CircuitBreakerMetrics {
    /// Export metrics in Prometheus format
    pub fn to_prometheus(&self, command: &str) -> String {
        let state_value = match self.state {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };

        format!(
            r#"# HELP circuit_breaker_state Current state of the circuit breaker (0=closed, 1=open, 2=half-open)
# TYPE circuit_breaker_state gauge
circuit_breaker_state{{command="{command}"}} {state_value}
# HELP circuit_breaker_error_percentage Error percentage over the rolling window
# TYPE circuit_breaker_error_percentage gauge
circuit_breaker_error_percentage{{command="{command}"}} {}
# HELP circuit_breaker_failures_total Total number of failures
# TYPE circuit_breaker_failures_total counter
circuit_breaker_failures_total{{command="{command}"}} {}
# HELP circuit_breaker_successes_total Total number of successes
# TYPE circuit_breaker_successes_total counter
circuit_breaker_successes_total{{command="{command}"}} {}
# HELP circuit_breaker_calls_total Total number of calls
# TYPE circuit_breaker_calls_total counter
circuit_breaker_calls_total{{command="{command}"}} {}
# HELP circuit_breaker_rejections_total Calls short-circuited by an open circuit
# TYPE circuit_breaker_rejections_total counter
circuit_breaker_rejections_total{{command="{command}"}} {}
# HELP circuit_breaker_state_transitions_total Total state transitions
# TYPE circuit_breaker_state_transitions_total counter
circuit_breaker_state_transitions_total{{command="{command}"}} {}
"#,
            self.error_percentage,
            self.total_failures,
            self.total_successes,
            self.total_calls,
            self.total_rejections,
            self.state_transitions,
        )
    }
}

/// Operator override that forces a command's circuit open.
#[async_trait]
pub trait KillSwitch: Send + Sync + Debug {
    async fn is_forced_open(&self, command: &str) -> bool;
}

#[derive(Debug, Default)]
pub struct InMemoryKillSwitch {
    forced: DashMap<String, bool>,
}

impl InMemoryKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_open(&self, command: &str) {
        warn!(command, "circuit forced open");
        self.forced.insert(command.to_string(), true);
    }

    pub fn release(&self, command: &str) {
        info!(command, "circuit override released");
        self.forced.remove(command);
    }
}

#[async_trait]
impl KillSwitch for InMemoryKillSwitch {
    async fn is_forced_open(&self, command: &str) -> bool {
        self.forced.get(command).map(|flag| *flag).unwrap_or(false)
    }
}

/// Kill switch flags kept in Redis so every gateway instance sees the same override.
/// A key `<namespace>:<command>` holding `1` or `true` forces the command open.
///
/// One multiplexed connection is opened on first use and shared afterwards.
/// Every lookup, connecting included, is bounded by `lookup_timeout`; a slow
/// or failed lookup leaves the circuit to the breaker.
pub struct RedisKillSwitch {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    namespace: String,
    lookup_timeout: Duration,
}

impl RedisKillSwitch {
    pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(100);

    pub fn new(redis_url: &str, namespace: impl Into<String>) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            namespace: namespace.into(),
            lookup_timeout: Self::DEFAULT_LOOKUP_TIMEOUT,
        })
    }

    pub fn with_lookup_timeout(mut self, lookup_timeout: Duration) -> Self {
        self.lookup_timeout = lookup_timeout;
        self
    }

    pub fn key(&self, command: &str) -> String {
        format!("{}:{}", self.namespace, command)
    }

    async fn connection(&self) -> Result<ConnectionManager, redis::RedisError> {
        self.connection
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await
            .map(ConnectionManager::clone)
    }

    async fn read_flag(&self, command: &str) -> Result<Option<String>, redis::RedisError> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(self.key(command))
            .query_async(&mut conn)
            .await
    }
}

impl Debug for RedisKillSwitch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisKillSwitch")
            .field("namespace", &self.namespace)
            .field("lookup_timeout", &self.lookup_timeout)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

#[async_trait]
impl KillSwitch for RedisKillSwitch {
    async fn is_forced_open(&self, command: &str) -> bool {
        match tokio::time::timeout(self.lookup_timeout, self.read_flag(command)).await {
            Ok(Ok(flag)) => flag
                .map(|value| matches!(value.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            Ok(Err(e)) => {
                warn!(command, error = %e, "kill switch lookup failed, treating circuit as not forced");
                false
            }
            Err(_) => {
                warn!(
                    command,
                    timeout_ms = self.lookup_timeout.as_millis() as u64,
                    "kill switch lookup timed out, treating circuit as not forced"
                );
                false
            }
        }
    }
}

/// Registry for the process-wide breakers, one per command name
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
    kill_switch: Arc<dyn KillSwitch>,
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig, kill_switch: Arc<dyn KillSwitch>) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config,
            kill_switch,
        }
    }

    /// A registry with default settings and an in-memory kill switch.
    pub fn in_memory() -> Self {
        Self::new(
            CircuitBreakerConfig::default(),
            Arc::new(InMemoryKillSwitch::new()),
        )
    }

    /// Get or create the circuit breaker for the given command
    pub fn get(&self, command: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(command.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(command, self.default_config.clone())))
            .clone()
    }

    pub fn kill_switch(&self) -> &Arc<dyn KillSwitch> {
        &self.kill_switch
    }

    pub async fn is_forced_open(&self, command: &str) -> bool {
        self.kill_switch.is_forced_open(command).await
    }

    /// Get all circuit breaker metrics
    pub fn metrics(&self) -> HashMap<String, CircuitBreakerMetrics> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    pub fn to_prometheus(&self) -> String {
        let mut metrics: Vec<_> = self.metrics().into_iter().collect();
        metrics.sort_by(|a, b| a.0.cmp(&b.0));
        metrics
            .iter()
            .map(|(command, m)| m.to_prometheus(command))
            .collect()
    }
}
