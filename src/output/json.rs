//! JSON output formatting
//!
//! Every report goes out in a versioned envelope so downstream tooling can
//! detect schema drift.

use chrono::Utc;
use serde::Serialize;

/// Envelope shared by all JSON reports
#[derive(Debug, Serialize)]
pub struct JsonReport<T: Serialize> {
    pub amorsize_version: &'static str,
    pub generated_at: String,
    #[serde(flatten)]
    pub payload: T,
}

/// Wrap a payload in the envelope and pretty-print it
pub fn render<T: Serialize>(payload: T) -> crate::Result<String> {
    let report = JsonReport {
        amorsize_version: env!("CARGO_PKG_VERSION"),
        generated_at: Utc::now().to_rfc3339(),
        payload,
    };
    Ok(serde_json::to_string_pretty(&report)?)
}

#[derive(Debug, Serialize)]
pub struct PlanPayload<'a> {
    pub plan: &'a crate::planner::OptimizationPlan,
}

#[derive(Debug, Serialize)]
pub struct StreamingPlanPayload<'a> {
    pub plan: &'a crate::planner::streaming::StreamingPlan,
}

#[derive(Debug, Serialize)]
pub struct HealthPayload<'a> {
    pub health: &'a crate::health::HealthReport,
}

#[derive(Debug, Serialize)]
pub struct SystemPayload<'a> {
    pub system: &'a crate::probe::SystemInfo,
}

#[derive(Debug, Serialize)]
pub struct CacheStatsPayload<'a> {
    pub cache: &'a crate::cache::CacheStats,
}
