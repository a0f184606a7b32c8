use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

// Global registry
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

// Metrics
pub static TOKENS_ISSUED_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static REFRESH_OUTCOMES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static DEVICE_POLLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
pub static DELETION_SWEEP_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn register_counter(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Create the registry and counters. Calling it again is a no-op.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let tokens_issued = register_counter(
        &registry,
        "identity_tokens_issued_total",
        "Token pairs issued, by issuance path",
        "source",
    )?;
    let refresh_outcomes = register_counter(
        &registry,
        "identity_refresh_outcomes_total",
        "Refresh token exchanges, by outcome",
        "outcome",
    )?;
    let device_polls = register_counter(
        &registry,
        "identity_device_polls_total",
        "Device code polls, by response code",
        "outcome",
    )?;
    let deletion_sweep = register_counter(
        &registry,
        "identity_deletion_sweep_total",
        "Subjects handled by the deletion sweep, by outcome",
        "outcome",
    )?;

    // Initialize globals
    let _ = REGISTRY.set(registry);
    let _ = TOKENS_ISSUED_TOTAL.set(tokens_issued);
    let _ = REFRESH_OUTCOMES_TOTAL.set(refresh_outcomes);
    let _ = DEVICE_POLLS_TOTAL.set(device_polls);
    let _ = DELETION_SWEEP_TOTAL.set(deletion_sweep);
    Ok(())
}

fn inc(counter: &OnceLock<IntCounterVec>, label: &str) {
    if let Some(counter) = counter.get() {
        counter.with_label_values(&[label]).inc();
    }
}

pub fn record_tokens_issued(source: &str) {
    inc(&TOKENS_ISSUED_TOTAL, source);
}

pub fn record_refresh_outcome(outcome: &str) {
    inc(&REFRESH_OUTCOMES_TOTAL, outcome);
}

pub fn record_device_poll(outcome: &str) {
    inc(&DEVICE_POLLS_TOTAL, outcome);
}

pub fn record_deletion_sweep(outcome: &str, count: u64) {
    if let Some(counter) = DELETION_SWEEP_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc_by(count);
    }
}

pub fn get_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();

    let registry = match REGISTRY.get() {
        Some(r) => r,
        None => {
            tracing::error!("Metrics registry not initialized");
            return "# Metrics registry not initialized\n".to_string();
        }
    };

    let metric_families = registry.gather();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return format!("# Failed to encode metrics: {}\n", e);
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Failed to convert metrics to UTF-8: {}", e);
            format!("# Failed to convert metrics to UTF-8: {}\n", e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_exposition() -> Result<(), prometheus::Error> {
        init_metrics()?;
        init_metrics()?;
        record_device_poll("slow_down");
        record_tokens_issued("device");

        let text = get_metrics();
        assert!(text.contains("identity_device_polls_total"));
        assert!(text.contains("slow_down"));
        Ok(())
    }
}
