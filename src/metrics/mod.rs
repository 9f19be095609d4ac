/*!
 * # Metrics Module
 *
 * In-memory counters for the purchase gateway, exported in Prometheus text
 * format or as JSON.
 *
 * ## Features
 *
 * - Purchase lifecycle metrics (initialized, processed, blocked, exhausted)
 * - Cascade metrics (biller advances, charges per biller outcome)
 * - External command metrics (calls, fallbacks, validation rejections, latency)
 */

use dashmap::DashMap;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Splits `name{labels}` into the metric family and its label set.
fn family_of(name: &str) -> (&str, &str) {
    match name.find('{') {
        Some(idx) => (&name[..idx], &name[idx..]),
        None => (name, ""),
    }
}

#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, value: u64) {
        self.value.fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Running count and sum of observations, in microseconds.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    sum_micros: Arc<AtomicU64>,
    count: Arc<AtomicU64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&self, duration: Duration) {
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get_sum_seconds(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, Counter>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create_counter(&self, name: &str) -> Counter {
        self.counters
            .entry(name.to_string())
            .or_insert_with(Counter::new)
            .clone()
    }

    pub fn get_or_create_histogram(&self, name: &str) -> Histogram {
        self.histograms
            .entry(name.to_string())
            .or_insert_with(Histogram::new)
            .clone()
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.counters.get(name).map(|c| c.get()).unwrap_or(0)
    }

    pub fn export_metrics(&self) -> String {
        let mut counters: Vec<(String, u64)> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().get()))
            .collect();
        counters.sort();

        let mut histograms: Vec<(String, Histogram)> = self
            .histograms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));

        let mut output = String::new();

        // Export counters, one TYPE line per family
        let mut last_family = "";
        for (name, value) in &counters {
            let family = family_of(name).0;
            if family != last_family {
                output.push_str(&format!("# TYPE {} counter\n", family));
                last_family = family;
            }
            output.push_str(&format!("{} {}\n", name, value));
        }

        // Export histograms
        for (name, histogram) in &histograms {
            let (family, labels) = family_of(name);
            output.push_str(&format!("# TYPE {} summary\n", family));
            output.push_str(&format!(
                "{}_count{} {}\n",
                family,
                labels,
                histogram.get_count()
            ));
            output.push_str(&format!(
                "{}_sum{} {}\n",
                family,
                labels,
                histogram.get_sum_seconds()
            ));
        }

        output
    }

    pub fn export_metrics_json(&self) -> serde_json::Value {
        let mut counters = serde_json::Map::new();
        for entry in self.counters.iter() {
            let (name, counter) = entry.pair();
            counters.insert(name.to_string(), json!(counter.get()));
        }

        let mut histograms = serde_json::Map::new();
        for entry in self.histograms.iter() {
            let (name, histogram) = entry.pair();
            histograms.insert(
                name.to_string(),
                json!({
                    "count": histogram.get_count(),
                    "sum_seconds": histogram.get_sum_seconds(),
                }),
            );
        }

        json!({
            "counters": counters,
            "histograms": histograms,
        })
    }
}

/// Gateway metrics, shared by the orchestrator and the command executors.
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    registry: Arc<MetricsRegistry>,
    pub purchases_initialized: Counter,
    pub purchases_processed: Counter,
    pub purchases_approved: Counter,
    pub purchases_blocked: Counter,
    pub cascades_exhausted: Counter,
    pub cascade_advances: Counter,
    pub captchas_validated: Counter,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new(Arc::new(MetricsRegistry::new()))
    }
}

impl GatewayMetrics {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self {
            purchases_initialized: registry.get_or_create_counter("purchases_initialized_total"),
            purchases_processed: registry.get_or_create_counter("purchases_processed_total"),
            purchases_approved: registry.get_or_create_counter("purchases_approved_total"),
            purchases_blocked: registry.get_or_create_counter("purchases_blocked_total"),
            cascades_exhausted: registry.get_or_create_counter("cascades_exhausted_total"),
            cascade_advances: registry.get_or_create_counter("cascade_advances_total"),
            captchas_validated: registry.get_or_create_counter("captchas_validated_total"),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn record_command_call(&self, command: &str, duration: Duration) {
        self.registry
            .get_or_create_counter(&format!("command_calls_total{{command=\"{}\"}}", command))
            .inc();
        self.registry
            .get_or_create_histogram(&format!("command_duration_seconds{{command=\"{}\"}}", command))
            .observe(duration);
    }

    pub fn record_fallback(&self, command: &str, reason: &str) {
        self.registry
            .get_or_create_counter(&format!(
                "command_fallbacks_total{{command=\"{}\",reason=\"{}\"}}",
                command, reason
            ))
            .inc();
    }

    pub fn record_validation_rejection(&self, command: &str) {
        self.registry
            .get_or_create_counter(&format!(
                "command_validation_failures_total{{command=\"{}\"}}",
                command
            ))
            .inc();
    }

    pub fn record_charge(&self, biller: &str, outcome: &str) {
        self.registry
            .get_or_create_counter(&format!(
                "biller_charges_total{{biller=\"{}\",outcome=\"{}\"}}",
                biller, outcome
            ))
            .inc();
    }

    pub fn fallbacks(&self, command: &str, reason: &str) -> u64 {
        self.registry.counter_value(&format!(
            "command_fallbacks_total{{command=\"{}\",reason=\"{}\"}}",
            command, reason
        ))
    }

    pub fn summary(&self) -> String {
        format!(
            "Initialized: {}, Processed: {}, Approved: {}, Blocked: {}, Exhausted: {}",
            self.purchases_initialized.get(),
            self.purchases_processed.get(),
            self.purchases_approved.get(),
            self.purchases_blocked.get(),
            self.cascades_exhausted.get(),
        )
    }
}
