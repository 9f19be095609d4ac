// Dependency adapters, each guarded by a circuit breaker
pub mod bin_routing;
pub mod fraud_recommendation;
pub mod http;
pub mod payment_template;

// Billers
pub mod biller;

// Purchase orchestration
pub mod purchase;

// Service factory for dependency injection
pub mod factory;
