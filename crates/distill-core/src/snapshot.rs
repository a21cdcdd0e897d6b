//! Structured controller snapshots.

use serde::Serialize;

/// Point-in-time summary of one feedback controller, suitable for logging
/// or exposing through a diagnostics endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerSnapshot {
    /// Controller name, e.g. `"concurrency"` or `"rate:analysis"`.
    pub name: String,
    /// Current limit (semaphore capacity or requests-per-minute).
    pub limit: u64,
    pub min_limit: u64,
    pub max_limit: u64,
    /// In-flight count, where the controller has one (concurrency only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_flight: Option<u64>,
    /// Smoothed latency in milliseconds, where tracked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ewma_ms: Option<f64>,
    /// Number of ticks that changed the limit.
    pub adjustments: u64,
    /// Human-readable description of the most recent decision.
    pub last_decision: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_optional_fields() {
        let snap = ControllerSnapshot {
            name: "rate:embedding".into(),
            limit: 500,
            min_limit: 100,
            max_limit: 3000,
            in_flight: None,
            ewma_ms: None,
            adjustments: 2,
            last_decision: "hold (empty window)".into(),
        };
        let json = serde_json::to_value(&snap).unwrap();
        assert!(json.get("in_flight").is_none());
        assert!(json.get("ewma_ms").is_none());
        assert_eq!(json["limit"], 500);
    }
}
