//! Request and token counters
//!
//! - `sharepoint_requests_total` (counter): labels `operation`, `status`
//! - `sharepoint_token_requests_total` (counter): label `outcome`
//!
//! The library only records; installing a recorder/exporter is up to the
//! host application. Without one these calls are no-ops.

/// Record a completed REST call. `status` is "error" when no response arrived.
pub fn record_request(operation: &'static str, status: Option<u16>) {
    let status = status.map_or_else(|| "error".to_string(), |s| s.to_string());
    metrics::counter!("sharepoint_requests_total", "operation" => operation, "status" => status)
        .increment(1);
}

/// Record a token acquisition attempt ("ok", "rejected", "failed").
pub fn record_token_request(outcome: &'static str) {
    metrics::counter!("sharepoint_token_requests_total", "outcome" => outcome).increment(1);
}
