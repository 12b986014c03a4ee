//! Canonical accounting record and its collector wire format
//!
//! A [`UsageRecord`] is rendered as an OGF `JobUsageRecord` XML document,
//! which is what the accounting collector ingests.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use uuid::Uuid;

use crate::error::{GratiaError, Result};

/// Description attached to time values supplied as epoch seconds
pub const SECONDS_DESCRIPTION: &str = "Was entered in seconds";

const UR_NAMESPACE: &str = "http://www.gridforum.org/2003/ur-wg";

/// Kind of resource a record accounts for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Batch,
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceType::Batch => write!(f, "Batch"),
        }
    }
}

/// One job's usage, ready to be sent to the collector
///
/// Times and durations are whole seconds; memory is in KB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub resource_type: ResourceType,
    pub start_time: i64,
    pub end_time: i64,
    pub wall_duration: i64,
    /// User-mode CPU time
    pub cpu_duration: i64,
    pub machine_name: Option<String>,
    pub local_job_id: Option<String>,
    /// Reported with description "RSS"
    pub memory_kb: i64,
    /// Maximum number of processors used
    pub processors: i64,
    pub site_name: Option<String>,
    pub probe_name: String,
    pub grid: Option<String>,
    pub local_user_id: String,
    pub vo_name: Option<String>,
    pub reportable_vo_name: Option<String>,
}

impl UsageRecord {
    /// Render as a `JobUsageRecord` document
    pub fn to_xml(&self) -> Result<String> {
        let created = Utc::now();
        let record_id = format!("{}:{}", self.probe_name, Uuid::new_v4());
        self.to_xml_with_identity(created, &record_id)
    }

    /// Render with an explicit record identity
    pub fn to_xml_with_identity(&self, created: DateTime<Utc>, record_id: &str) -> Result<String> {
        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;

        let mut root = BytesStart::new("JobUsageRecord");
        root.push_attribute(("xmlns", UR_NAMESPACE));
        root.push_attribute(("xmlns:urwg", UR_NAMESPACE));
        w.write_event(Event::Start(root)).map_err(xml_error)?;

        let mut identity = BytesStart::new("RecordIdentity");
        identity.push_attribute(("urwg:createTime", format_time(created.timestamp()).as_str()));
        identity.push_attribute(("urwg:recordId", record_id));
        w.write_event(Event::Empty(identity)).map_err(xml_error)?;

        open(&mut w, "JobIdentity")?;
        optional(&mut w, "LocalJobId", self.local_job_id.as_deref())?;
        close(&mut w, "JobIdentity")?;

        open(&mut w, "UserIdentity")?;
        element(&mut w, "LocalUserId", &[], &self.local_user_id)?;
        optional(&mut w, "VOName", self.vo_name.as_deref())?;
        optional(&mut w, "ReportableVOName", self.reportable_vo_name.as_deref())?;
        close(&mut w, "UserIdentity")?;

        optional(&mut w, "MachineName", self.machine_name.as_deref())?;
        optional(&mut w, "SiteName", self.site_name.as_deref())?;
        element(&mut w, "ProbeName", &[], &self.probe_name)?;
        optional(&mut w, "Grid", self.grid.as_deref())?;

        let seconds = [("urwg:description", SECONDS_DESCRIPTION)];
        element(&mut w, "StartTime", &seconds, &format_time(self.start_time))?;
        element(&mut w, "EndTime", &seconds, &format_time(self.end_time))?;
        element(&mut w, "WallDuration", &seconds, &format_duration(self.wall_duration))?;
        element(
            &mut w,
            "CpuDuration",
            &[("urwg:usageType", "user"), ("urwg:description", SECONDS_DESCRIPTION)],
            &format_duration(self.cpu_duration),
        )?;
        element(
            &mut w,
            "Memory",
            &[
                ("urwg:storageUnit", "KB"),
                ("urwg:phaseUnit", "PT0S"),
                ("urwg:description", "RSS"),
            ],
            &self.memory_kb.to_string(),
        )?;
        element(
            &mut w,
            "Processors",
            &[("urwg:metric", "max")],
            &self.processors.to_string(),
        )?;
        element(&mut w, "ResourceType", &[], &self.resource_type.to_string())?;

        close(&mut w, "JobUsageRecord")?;

        String::from_utf8(w.into_inner()).map_err(|e| GratiaError::Serialization(e.to_string()))
    }
}

/// Epoch seconds as an RFC 3339 UTC timestamp; out-of-range values clamp to the epoch
pub fn format_time(epoch_secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(epoch_secs, 0)
        .unwrap_or_default()
        .format("%Y-%m-%dT%H:%M:%SZ")
        .to_string()
}

/// Seconds as an ISO 8601 duration
pub fn format_duration(secs: i64) -> String {
    format!("PT{}S", secs)
}

fn xml_error<E: std::fmt::Display>(e: E) -> GratiaError {
    GratiaError::Serialization(e.to_string())
}

fn open<W: std::io::Write>(w: &mut Writer<W>, name: &str) -> Result<()> {
    w.write_event(Event::Start(BytesStart::new(name)))
        .map_err(xml_error)
}

fn close<W: std::io::Write>(w: &mut Writer<W>, name: &str) -> Result<()> {
    w.write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)
}

fn element<W: std::io::Write>(
    w: &mut Writer<W>,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> Result<()> {
    let mut start = BytesStart::new(name);
    for &attribute in attributes {
        start.push_attribute(attribute);
    }
    w.write_event(Event::Start(start)).map_err(xml_error)?;
    w.write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    close(w, name)
}

fn optional<W: std::io::Write>(w: &mut Writer<W>, name: &str, text: Option<&str>) -> Result<()> {
    match text {
        Some(text) => element(w, name, &[], text),
        None => Ok(()),
    }
}
