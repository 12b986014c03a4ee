//! APEL individual job records
//!
//! Queue payloads are `key: value` text blocks. Only payloads starting with
//! [`INDIVIDUAL_JOB_MARKER`] describe a single job; everything else in the
//! queue (summaries, sync messages) is not forwarded.
//!
//! # Example payload
//! ```text
//! APEL-individual-job-message: v0.3
//! Site: Example-K8s
//! LocalJobId: pod-1234
//! StartTime: 1700000000
//! EndTime: 1700003600.7
//! WallDuration: 3600
//! CpuDuration: 1800
//! Processors: 2
//! MemoryVirtual: 2097152
//! VO: osg
//! InfrastructureType: grid
//! ```

use gratia_common::vo::VoResolver;
use gratia_common::{GratiaError, ResourceType, Result, UsageRecord};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Leading text of an individual job record payload
pub const INDIVIDUAL_JOB_MARKER: &str = "APEL-individual-job-message:";

/// Local account reported for every Kubernetes job
pub const LOCAL_USER: &str = "osgvo-container-pilot";

#[allow(clippy::unwrap_used)]
static NON_DNS_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9-]").unwrap());

/// Probe name reported for a site: `kubernetes:<site>.gratia.osg-htc.org`
///
/// Every character outside `[A-Za-z0-9-]` becomes `-`, then leading and
/// trailing dashes are stripped.
pub fn derived_probe_id(site: &str) -> String {
    let sanitized = NON_DNS_CHARS.replace_all(site, "-");
    format!("kubernetes:{}.gratia.osg-htc.org", sanitized.trim_matches('-'))
}

/// Parsed key/value view of one queue payload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApelRecord {
    fields: HashMap<String, String>,
}

impl ApelRecord {
    /// Whether the raw payload is an individual job record
    pub fn is_individual_record(payload: &[u8]) -> bool {
        payload.starts_with(INDIVIDUAL_JOB_MARKER.as_bytes())
    }

    /// Parse a payload into fields
    ///
    /// A line is kept only when splitting it on `:` yields exactly two
    /// parts, so values containing a colon are dropped. Keys and values are
    /// trimmed and a repeated key keeps its last value.
    pub fn parse(payload: &[u8]) -> Self {
        let text = String::from_utf8_lossy(payload);
        let mut fields = HashMap::new();

        for line in text.split('\n') {
            let parts: Vec<&str> = line.split(':').map(str::trim).collect();
            if let [key, value] = parts.as_slice() {
                fields.insert(key.to_string(), value.to_string());
            }
        }

        Self { fields }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Integer value of a field: 0 when absent, otherwise the number truncated toward zero
    ///
    /// Values beyond the `i64` range saturate. NaN and infinities are errors.
    pub fn get_int(&self, key: &str) -> Result<i64> {
        let Some(raw) = self.get(key) else {
            return Ok(0);
        };

        match raw.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(value.trunc() as i64),
            _ => Err(GratiaError::format(key, raw)),
        }
    }

    /// Probe name derived from the `Site` field
    pub fn site_probe(&self) -> Result<String> {
        self.get("Site")
            .map(derived_probe_id)
            .ok_or_else(|| GratiaError::MissingField("Site".to_string()))
    }

    /// Convert to the canonical usage record
    ///
    /// `VOName` and `ReportableVOName` both carry the raw `VO` field unless a
    /// resolver is given, in which case the reportable name goes through its
    /// display-name table.
    pub fn to_usage_record(&self, resolver: Option<&VoResolver>) -> Result<UsageRecord> {
        let vo = self.get("VO");
        let reportable_vo = match resolver {
            Some(resolver) => vo.map(|vo| resolver.resolve_display_name(vo).to_string()),
            None => vo.map(str::to_string),
        };

        Ok(UsageRecord {
            resource_type: ResourceType::Batch,
            start_time: self.get_int("StartTime")?,
            end_time: self.get_int("EndTime")?,
            wall_duration: self.get_int("WallDuration")?,
            cpu_duration: self.get_int("CpuDuration")?,
            machine_name: self.get("MachineName").map(str::to_string),
            local_job_id: self.get("LocalJobId").map(str::to_string),
            memory_kb: self.get_int("MemoryVirtual")?,
            processors: self.get_int("Processors")?,
            site_name: self.get("Site").map(str::to_string),
            probe_name: self.site_probe()?,
            // Best guess; APEL has no direct equivalent of Grid
            grid: self.get("InfrastructureType").map(str::to_string),
            local_user_id: LOCAL_USER.to_string(),
            vo_name: vo.map(str::to_string),
            reportable_vo_name: reportable_vo,
        })
    }
}
