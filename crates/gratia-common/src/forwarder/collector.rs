//! HTTP forwarder for a Gratia accounting collector
//!
//! Every record is written to the outbox directory before it is bundled,
//! and deleted only once the collector acknowledges it. Whatever a failed
//! run leaves in the outbox is picked up by `search_outstanding` and
//! `reprocess_outstanding` on the next run.

use async_trait::async_trait;
use chrono::Utc;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{Forwarder, SendResponse};
use crate::error::{GratiaError, Result};
use crate::record::UsageRecord;

const OUTBOX_PREFIX: &str = "r.";
const OUTBOX_SUFFIX: &str = ".xml";
const BUNDLE_SEPARATOR: &str = "|";

/// Connection and bundling settings for [`CollectorForwarder`]
#[derive(Debug, Clone)]
pub struct CollectorSettings {
    /// Full collector endpoint, e.g. `https://collector.example.org/gratia-servlets/rmi`
    pub collector_url: String,
    /// Directory holding records not yet acknowledged
    pub outbox_dir: PathBuf,
    /// Records per `multiupdate` request
    pub bundle_size: usize,
    /// Reporter name announced in the handshake
    pub reporter: String,
    /// Service name announced in the handshake
    pub service: String,
    pub probe_version: String,
    pub timeout: Duration,
}

struct PendingRecord {
    path: PathBuf,
    xml: String,
}

/// Outcome of one `reprocess_outstanding` pass
#[derive(Debug, Default, PartialEq, Eq)]
struct ReprocessReport {
    total: usize,
    resent: usize,
    unreadable: usize,
    /// Records left unsent after a rejection, counting from the rejected one
    remaining: usize,
}

/// [`Forwarder`] talking to a Gratia collector over HTTP
pub struct CollectorForwarder {
    client: reqwest::Client,
    settings: CollectorSettings,
    site_name: String,
    probe_name: String,
    bundle: Vec<PendingRecord>,
    outstanding: Vec<PathBuf>,
}

impl CollectorForwarder {
    pub fn new(settings: CollectorSettings) -> Result<Self> {
        if settings.bundle_size == 0 {
            return Err(GratiaError::config("bundle size must be greater than 0"));
        }

        std::fs::create_dir_all(&settings.outbox_dir)?;

        let client = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(format!("{}/{}", settings.reporter, settings.probe_version))
            .build()?;

        Ok(Self {
            client,
            settings,
            site_name: String::new(),
            probe_name: String::new(),
            bundle: Vec::new(),
            outstanding: Vec::new(),
        })
    }

    pub fn outbox_dir(&self) -> &Path {
        &self.settings.outbox_dir
    }

    /// Records currently held in the bundle
    pub fn pending(&self) -> usize {
        self.bundle.len()
    }

    async fn post(&self, command: &str, payload: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.settings.collector_url)
            .form(&[
                ("command", command),
                ("arg1", payload),
                ("from", self.probe_name.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body = response.text().await?;
        let body = body.trim();
        if body.starts_with("OK") {
            Ok(body.to_string())
        } else {
            Err(GratiaError::Collector(body.to_string()))
        }
    }

    async fn write_outbox(&self, xml: &str) -> Result<PathBuf> {
        let name = format!(
            "{}{:013}.{}{}",
            OUTBOX_PREFIX,
            Utc::now().timestamp_millis(),
            Uuid::new_v4().simple(),
            OUTBOX_SUFFIX
        );
        let path = self.settings.outbox_dir.join(name);
        tokio::fs::write(&path, xml).await?;
        Ok(path)
    }

    async fn flush(&mut self) -> Result<Option<String>> {
        if self.bundle.is_empty() {
            return Ok(None);
        }

        let bundle = std::mem::take(&mut self.bundle);
        let payload = bundle
            .iter()
            .map(|r| r.xml.as_str())
            .collect::<Vec<_>>()
            .join(BUNDLE_SEPARATOR);

        let message = self.post("multiupdate", &payload).await?;
        info!(records = bundle.len(), response = %message, "Collector acknowledged bundle");

        for record in &bundle {
            if let Err(e) = tokio::fs::remove_file(&record.path).await {
                warn!(path = %record.path.display(), error = %e, "Failed to remove acknowledged record from outbox");
            }
        }

        Ok(Some(message))
    }

    /// Re-send outstanding records one by one, stopping at the first rejection
    async fn resend_outstanding(&mut self) -> ReprocessReport {
        let outstanding = std::mem::take(&mut self.outstanding);
        let mut report = ReprocessReport {
            total: outstanding.len(),
            ..ReprocessReport::default()
        };

        for (attempted, path) in outstanding.iter().enumerate() {
            let xml = match tokio::fs::read_to_string(path).await {
                Ok(xml) => xml,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Cannot read outstanding record; leaving it in the outbox");
                    report.unreadable += 1;
                    continue;
                },
            };

            if let Err(e) = self.post("update", &xml).await {
                report.remaining = report.total - attempted;
                warn!(
                    error = %e,
                    remaining = report.remaining,
                    "Reprocessing outstanding records stopped; they will be retried on the next run"
                );
                break;
            }

            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Failed to remove reprocessed record from outbox");
            }
            report.resent += 1;
        }

        report
    }

    fn probe_details_xml(&self) -> Result<String> {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "localhost".to_string());
        let version = self.settings.probe_version.as_str();

        let mut w = Writer::new(Vec::new());
        w.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
            .map_err(xml_error)?;
        w.write_event(Event::Start(BytesStart::new("ProbeDetails")))
            .map_err(xml_error)?;

        let fields: [(&str, Option<&str>, &str); 6] = [
            ("ProbeName", None, &self.probe_name),
            ("SiteName", None, &self.site_name),
            ("Hostname", None, &host),
            ("ReporterLibrary", Some(env!("CARGO_PKG_VERSION")), env!("CARGO_PKG_NAME")),
            ("Reporter", Some(version), &self.settings.reporter),
            ("Service", Some(version), &self.settings.service),
        ];
        for (name, version, text) in fields {
            let mut start = BytesStart::new(name);
            if let Some(version) = version {
                start.push_attribute(("version", version));
            }
            w.write_event(Event::Start(start)).map_err(xml_error)?;
            w.write_event(Event::Text(BytesText::new(text)))
                .map_err(xml_error)?;
            w.write_event(Event::End(BytesEnd::new(name)))
                .map_err(xml_error)?;
        }

        w.write_event(Event::End(BytesEnd::new("ProbeDetails")))
            .map_err(xml_error)?;
        String::from_utf8(w.into_inner()).map_err(xml_error)
    }
}

#[async_trait]
impl Forwarder for CollectorForwarder {
    fn configure(&mut self, site_name: &str, probe_name: &str) {
        self.site_name = site_name.to_string();
        self.probe_name = probe_name.to_string();
    }

    async fn handshake(&mut self) -> Result<()> {
        if self.probe_name.is_empty() {
            return Err(GratiaError::config("handshake before the probe name was configured"));
        }

        let details = self.probe_details_xml()?;
        let message = self.post("update", &details).await?;
        debug!(probe = %self.probe_name, response = %message, "Handshake accepted");
        Ok(())
    }

    async fn search_outstanding(&mut self) -> Result<usize> {
        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.settings.outbox_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(OUTBOX_PREFIX) && name.ends_with(OUTBOX_SUFFIX) {
                found.push(entry.path());
            }
        }
        found.sort();

        if !found.is_empty() {
            info!(count = found.len(), outbox = %self.settings.outbox_dir.display(), "Found outstanding records");
        }
        self.outstanding = found;
        Ok(self.outstanding.len())
    }

    async fn reprocess_outstanding(&mut self) -> Result<()> {
        let report = self.resend_outstanding().await;
        if report.total > 0 {
            info!(
                resent = report.resent,
                unreadable = report.unreadable,
                total = report.total,
                "Reprocessed outstanding records"
            );
        }
        Ok(())
    }

    async fn send(&mut self, record: &UsageRecord) -> Result<SendResponse> {
        let xml = record.to_xml()?;
        let path = self.write_outbox(&xml).await?;
        self.bundle.push(PendingRecord { path, xml });

        if self.bundle.len() >= self.settings.bundle_size {
            let message = self.flush().await?.unwrap_or_default();
            return Ok(SendResponse::Sent { message });
        }

        Ok(SendResponse::Bundled {
            pending: self.bundle.len(),
        })
    }

    async fn flush_bundle(&mut self) -> Result<()> {
        self.flush().await.map(|_| ())
    }
}

fn xml_error<E: std::fmt::Display>(e: E) -> GratiaError {
    GratiaError::Serialization(e.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::ResourceType;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RMI_PATH: &str = "/gratia-servlets/rmi";

    fn settings(server: &MockServer, outbox: &Path, bundle_size: usize) -> CollectorSettings {
        CollectorSettings {
            collector_url: format!("{}{}", server.uri(), RMI_PATH),
            outbox_dir: outbox.to_path_buf(),
            bundle_size,
            reporter: "kubernetes_meter".to_string(),
            service: "Kubernetes".to_string(),
            probe_version: "1.0.0".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn record(job: &str) -> UsageRecord {
        UsageRecord {
            resource_type: ResourceType::Batch,
            start_time: 100,
            end_time: 200,
            wall_duration: 100,
            cpu_duration: 50,
            machine_name: None,
            local_job_id: Some(job.to_string()),
            memory_kb: 0,
            processors: 1,
            site_name: Some("Site".to_string()),
            probe_name: "kubernetes:Site.gratia.osg-htc.org".to_string(),
            grid: None,
            local_user_id: "osgvo-container-pilot".to_string(),
            vo_name: Some("osg".to_string()),
            reportable_vo_name: Some("osg".to_string()),
        }
    }

    fn outbox_len(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[tokio::test]
    async fn test_handshake_posts_meter_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RMI_PATH))
            .and(body_string_contains("command=update"))
            .and(body_string_contains("ProbeDetails"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");
        forwarder.handshake().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_requires_configuration() {
        let server = MockServer::start().await;
        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();

        let err = forwarder.handshake().await.unwrap_err();
        assert!(matches!(err, GratiaError::Config(_)));
    }

    #[tokio::test]
    async fn test_flush_sends_bundle_and_clears_outbox() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(RMI_PATH))
            .and(body_string_contains("command=multiupdate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK - 2 records"))
            .expect(1)
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");

        let response = forwarder.send(&record("a")).await.unwrap();
        assert_eq!(response, SendResponse::Bundled { pending: 1 });
        forwarder.send(&record("b")).await.unwrap();
        assert_eq!(outbox_len(outbox.path()), 2);

        forwarder.flush_bundle().await.unwrap();
        assert_eq!(forwarder.pending(), 0);
        assert_eq!(outbox_len(outbox.path()), 0);
    }

    #[tokio::test]
    async fn test_full_bundle_flushes_on_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=multiupdate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 1)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");

        let response = forwarder.send(&record("a")).await.unwrap();
        assert!(matches!(response, SendResponse::Sent { .. }));
        forwarder.flush_bundle().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_bundle_stays_outstanding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=multiupdate"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Error: database unavailable"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(body_string_contains("command=update"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(2)
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");
        forwarder.send(&record("a")).await.unwrap();
        forwarder.send(&record("b")).await.unwrap();

        let err = forwarder.flush_bundle().await.unwrap_err();
        assert!(matches!(err, GratiaError::Collector(_)));
        assert_eq!(outbox_len(outbox.path()), 2);

        // A later session finds and resends them individually
        let mut next = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        next.configure("Site", "kubernetes:Site.gratia.osg-htc.org");
        assert_eq!(next.search_outstanding().await.unwrap(), 2);
        next.reprocess_outstanding().await.unwrap();
        assert_eq!(outbox_len(outbox.path()), 0);
    }

    #[tokio::test]
    async fn test_reprocess_report_excludes_unreadable_records() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Error: database unavailable"))
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        // Sorts first and cannot be read as a file
        std::fs::create_dir(outbox.path().join("r.0000000000000.unreadable.xml")).unwrap();
        std::fs::write(outbox.path().join("r.0000000000001.a.xml"), "<a/>").unwrap();
        std::fs::write(outbox.path().join("r.0000000000002.b.xml"), "<b/>").unwrap();

        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");
        assert_eq!(forwarder.search_outstanding().await.unwrap(), 3);

        let report = forwarder.resend_outstanding().await;
        assert_eq!(
            report,
            ReprocessReport {
                total: 3,
                resent: 0,
                unreadable: 1,
                remaining: 2,
            }
        );
        assert_eq!(outbox_len(outbox.path()), 3);
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_http_error_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let outbox = tempfile::tempdir().unwrap();
        let mut forwarder = CollectorForwarder::new(settings(&server, outbox.path(), 10)).unwrap();
        forwarder.configure("Site", "kubernetes:Site.gratia.osg-htc.org");

        assert!(matches!(
            forwarder.handshake().await.unwrap_err(),
            GratiaError::Http(_)
        ));
    }
}
