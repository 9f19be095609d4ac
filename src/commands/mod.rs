use crate::{
    circuit_breaker::{CircuitBreaker, CircuitBreakerRegistry},
    metrics::GatewayMetrics,
};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// How a command's call to its dependency failed.
///
/// Only `Recoverable` failures count against the circuit breaker. A
/// `Validation` failure is the caller's mistake and is handed back untouched,
/// so one bad request cannot open the circuit for everybody else.
#[derive(Debug)]
pub enum CommandFailure<E> {
    Recoverable(E),
    Validation(E),
}

/// Why a command is falling back instead of returning its own result.
#[derive(Debug)]
pub enum FallbackReason<E> {
    /// An operator forced the circuit open
    ForcedOpen,
    CircuitOpen,
    Timeout(Duration),
    Failure(E),
}

impl<E> FallbackReason<E> {
    pub fn label(&self) -> &'static str {
        match self {
            FallbackReason::ForcedOpen => "forced_open",
            FallbackReason::CircuitOpen => "circuit_open",
            FallbackReason::Timeout(_) => "timeout",
            FallbackReason::Failure(_) => "failure",
        }
    }
}

/// A single guarded call to an external dependency.
///
/// Each command carries its own call arguments. `run` performs the real call;
/// `fallback` decides what the caller gets when the call cannot be made or
/// fails: a safe default, or an error when there is none.
#[async_trait]
pub trait ExternalCommand: Send + Sync {
    type Output: Send;
    type Error: std::fmt::Display + Send;

    /// Breaker key; commands sharing a name share a circuit.
    fn name(&self) -> &'static str;

    async fn run(&self) -> Result<Self::Output, CommandFailure<Self::Error>>;

    fn fallback(&self, reason: FallbackReason<Self::Error>) -> Result<Self::Output, Self::Error>;
}

/// Runs [`ExternalCommand`]s under their shared circuit breaker and a call timeout.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    breakers: Arc<CircuitBreakerRegistry>,
    timeout: Duration,
    metrics: GatewayMetrics,
}

impl CommandExecutor {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>, timeout: Duration) -> Self {
        Self {
            breakers,
            timeout,
            metrics: GatewayMetrics::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: GatewayMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Same breakers and metrics, different call timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn breaker(&self, command: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(command)
    }

    #[instrument(skip(self, command), fields(command = command.name()))]
    pub async fn execute<C>(&self, command: &C) -> Result<C::Output, C::Error>
    where
        C: ExternalCommand,
    {
        let name = command.name();
        let breaker = self.breakers.get(name);

        if self.is_forced_open(name).await {
            breaker.record_rejection();
            return self.fall_back(command, FallbackReason::ForcedOpen);
        }
        if !breaker.allow_request() {
            breaker.record_rejection();
            return self.fall_back(command, FallbackReason::CircuitOpen);
        }

        let started = Instant::now();
        let outcome = tokio::time::timeout(self.timeout, command.run()).await;
        self.metrics.record_command_call(name, started.elapsed());

        match outcome {
            Ok(Ok(output)) => {
                breaker.record_success();
                Ok(output)
            }
            Ok(Err(CommandFailure::Validation(e))) => {
                debug!(error = %e, "request rejected by validation, not counted against the circuit");
                self.metrics.record_validation_rejection(name);
                Err(e)
            }
            Ok(Err(CommandFailure::Recoverable(e))) => {
                breaker.record_failure();
                warn!(error = %e, "command failed");
                self.fall_back(command, FallbackReason::Failure(e))
            }
            Err(_) => {
                breaker.record_failure();
                warn!(timeout_ms = self.timeout.as_millis() as u64, "command timed out");
                self.fall_back(command, FallbackReason::Timeout(self.timeout))
            }
        }
    }

    /// The override lookup shares the call timeout; a lookup that does not
    /// answer in time leaves the decision to the breaker.
    async fn is_forced_open(&self, name: &str) -> bool {
        match tokio::time::timeout(self.timeout, self.breakers.is_forced_open(name)).await {
            Ok(forced) => forced,
            Err(_) => {
                warn!(command = name, "kill switch did not answer in time, ignoring it");
                false
            }
        }
    }

    fn fall_back<C>(
        &self,
        command: &C,
        reason: FallbackReason<C::Error>,
    ) -> Result<C::Output, C::Error>
    where
        C: ExternalCommand,
    {
        let label = reason.label();
        warn!(command = command.name(), reason = label, "falling back");
        self.metrics.record_fallback(command.name(), label);
        command.fallback(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, CircuitState, InMemoryKillSwitch, KillSwitch};
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum Outcome {
        Live(u32),
        Default(&'static str),
    }

    #[derive(Debug, thiserror::Error, PartialEq)]
    enum FakeError {
        #[error("dependency down")]
        Down,
        #[error("bad input")]
        BadInput,
    }

    enum Behaviour {
        Succeed,
        Fail,
        Reject,
        Hang,
    }

    struct FakeCommand {
        behaviour: Behaviour,
        runs: AtomicU32,
    }

    impl FakeCommand {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                runs: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ExternalCommand for FakeCommand {
        type Output = Outcome;
        type Error = FakeError;

        fn name(&self) -> &'static str {
            "ledger_lookup"
        }

        async fn run(&self) -> Result<Outcome, CommandFailure<FakeError>> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            match self.behaviour {
                Behaviour::Succeed => Ok(Outcome::Live(7)),
                Behaviour::Fail => Err(CommandFailure::Recoverable(FakeError::Down)),
                Behaviour::Reject => Err(CommandFailure::Validation(FakeError::BadInput)),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Outcome::Live(0))
                }
            }
        }

        fn fallback(&self, reason: FallbackReason<FakeError>) -> Result<Outcome, FakeError> {
            Ok(Outcome::Default(reason.label()))
        }
    }

    fn executor(kill_switch: Arc<dyn KillSwitch>) -> CommandExecutor {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                rolling_window_size: 10,
                request_volume_threshold: 2,
                error_threshold_percentage: 50,
                sleep_window: Duration::from_secs(60),
                success_threshold: 1,
            },
            kill_switch,
        );
        CommandExecutor::new(Arc::new(registry), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn success_passes_through() {
        let executor = executor(Arc::new(InMemoryKillSwitch::new()));
        let result = executor.execute(&FakeCommand::new(Behaviour::Succeed)).await;
        assert_eq!(result, Ok(Outcome::Live(7)));
        assert_eq!(executor.breaker("ledger_lookup").metrics().total_successes, 1);
    }

    #[tokio::test]
    async fn failures_fall_back_and_open_the_circuit() {
        let executor = executor(Arc::new(InMemoryKillSwitch::new()));
        let failing = FakeCommand::new(Behaviour::Fail);

        for _ in 0..2 {
            let result = executor.execute(&failing).await;
            assert_eq!(result, Ok(Outcome::Default("failure")));
        }
        assert_eq!(executor.breaker("ledger_lookup").state(), CircuitState::Open);

        let healthy = FakeCommand::new(Behaviour::Succeed);
        let result = executor.execute(&healthy).await;
        assert_eq!(result, Ok(Outcome::Default("circuit_open")));
        assert_eq!(healthy.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure() {
        let executor = executor(Arc::new(InMemoryKillSwitch::new()));
        let result = executor.execute(&FakeCommand::new(Behaviour::Hang)).await;
        assert_eq!(result, Ok(Outcome::Default("timeout")));
        assert_eq!(executor.breaker("ledger_lookup").metrics().total_failures, 1);
    }

    #[tokio::test]
    async fn validation_failures_never_trip_the_breaker() {
        let executor = executor(Arc::new(InMemoryKillSwitch::new()));
        let rejecting = FakeCommand::new(Behaviour::Reject);
        for _ in 0..5 {
            assert_matches!(executor.execute(&rejecting).await, Err(FakeError::BadInput));
        }
        let breaker = executor.breaker("ledger_lookup");
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.metrics().total_calls, 0);
    }

    #[tokio::test]
    async fn kill_switch_short_circuits() {
        let kill_switch = Arc::new(InMemoryKillSwitch::new());
        kill_switch.force_open("ledger_lookup");
        let executor = executor(kill_switch.clone());

        let command = FakeCommand::new(Behaviour::Succeed);
        assert_eq!(
            executor.execute(&command).await,
            Ok(Outcome::Default("forced_open"))
        );
        assert_eq!(command.runs.load(Ordering::SeqCst), 0);

        kill_switch.release("ledger_lookup");
        assert_eq!(executor.execute(&command).await, Ok(Outcome::Live(7)));
    }

    #[derive(Debug)]
    struct StalledKillSwitch;

    #[async_trait]
    impl KillSwitch for StalledKillSwitch {
        async fn is_forced_open(&self, _command: &str) -> bool {
            tokio::time::sleep(Duration::from_secs(5)).await;
            true
        }
    }

    #[tokio::test]
    async fn stalled_kill_switch_cannot_hold_up_the_call() {
        let executor = executor(Arc::new(StalledKillSwitch));
        let command = FakeCommand::new(Behaviour::Succeed);

        let result = tokio::time::timeout(Duration::from_secs(1), executor.execute(&command))
            .await
            .expect("execute must not wait on the kill switch");
        assert_eq!(result, Ok(Outcome::Live(7)));
        assert_eq!(command.runs.load(Ordering::SeqCst), 1);
    }
}
