//! Metric counters for the sync engine.
//!
//! Nothing is exported from here. Counters are recorded through the `metrics`
//! facade and stay no-ops until the host installs a recorder.

use metrics::counter;

// Metric names as constants for consistency
const MUTATIONS_TOTAL: &str = "study_sync_mutations_total";
const RECONCILIATIONS_TOTAL: &str = "study_sync_reconciliations_total";
const REMOTE_FAILURES_TOTAL: &str = "study_sync_remote_failures_total";
const LOCAL_FAILURES_TOTAL: &str = "study_sync_local_failures_total";
const HANDLER_PANICS_TOTAL: &str = "study_sync_handler_panics_total";

/// Record a local mutation (`set`, `clear-one`, `import`, `clear`).
pub fn record_mutation(domain: &'static str, kind: &'static str) {
    counter!(MUTATIONS_TOTAL, "domain" => domain, "kind" => kind).increment(1);
}

/// Record the outcome of one reconciliation run.
///
/// `outcome` is one of `merged`, `skipped`, `failed` or `discarded`.
pub fn record_reconciliation(domain: &'static str, outcome: &'static str) {
    counter!(RECONCILIATIONS_TOTAL, "domain" => domain, "outcome" => outcome).increment(1);
}

/// Record a remote failure that was reported as a `<domain>:error` event.
pub fn record_remote_failure(domain: &'static str, operation: &'static str) {
    counter!(REMOTE_FAILURES_TOTAL, "domain" => domain, "operation" => operation).increment(1);
}

/// Record a failed write to or removal of the local mirror.
pub fn record_local_failure(domain: &'static str) {
    counter!(LOCAL_FAILURES_TOTAL, "domain" => domain).increment(1);
}

/// Record a bus handler that panicked and was isolated.
pub fn record_handler_panic(topic: &str) {
    counter!(HANDLER_PANICS_TOTAL, "topic" => topic.to_string()).increment(1);
}
