//! Alert Emitter: classifies severity, enriches, persists, and fans an alert
//! out to the append log / persistent store / dashboard push / webhook
//! notifiers. Sinks run in the fixed order {log, store, push, notifiers}; a
//! failure in any one sink is isolated and never blocks the others.

use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use lettre::message::Message;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};
use serde_json::json;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::IdsConfig;
use crate::detector::ThreatHit;
use crate::enrichment::{self, GeoProvider, ReputationProvider};
use crate::store::SqliteAlertStore;
use crate::types::{Alert, Severity};

/// Per-sink failure/success counters, exposed for operational metrics per
/// the error handling design's "internal counters" requirement.
#[derive(Debug, Default)]
pub struct EmitterStats {
    pub log_failures: std::sync::atomic::AtomicU64,
    pub store_failures: std::sync::atomic::AtomicU64,
    pub push_failures: std::sync::atomic::AtomicU64,
    pub notifier_failures: std::sync::atomic::AtomicU64,
}

impl EmitterStats {
    fn bump(counter: &std::sync::atomic::AtomicU64) {
        counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Newline-delimited JSON append log. One JSON object per line, matching the
/// egress alert JSON shape exactly.
pub struct AppendLog {
    file: Mutex<tokio::fs::File>,
}

impl AppendLog {
    pub async fn open(path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Self { file: Mutex::new(file) })
    }

    async fn write(&self, alert_json: &str) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::End(0)).await?;
        file.write_all(alert_json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await
    }
}

/// Alert serialized to the egress JSON shape documented in the external
/// interfaces section: flat fields, enrichment fields present only when
/// available.
fn alert_to_json(alert: &Alert) -> serde_json::Value {
    let mut value = json!({
        "timestamp": alert.timestamp.to_rfc3339(),
        "threat_type": match alert.threat_type {
            crate::types::ThreatType::Anomalous => "anomaly",
            _ => "signature",
        },
        "rule": alert.rule,
        "source_ip": alert.source_ip.to_string(),
        "destination_ip": alert.target_ip.map(|ip| ip.to_string()),
        "confidence": alert.confidence,
        "severity": alert.severity.to_string(),
        "details": {
            "description": alert.description,
            "affected_ports": alert.affected_ports,
        },
    });

    let obj = value.as_object_mut().expect("object literal");
    if let Some(score) = alert.enrichment.abuse_score {
        obj.insert("abuse_score".to_string(), json!(score));
        obj.insert(
            "is_known_threat".to_string(),
            json!(alert.enrichment.is_known_threat.unwrap_or(false)),
        );
    }
    if !alert.enrichment.threat_categories.is_empty() {
        obj.insert(
            "threat_categories".to_string(),
            json!(alert.enrichment.threat_categories),
        );
    }
    if let Some(reports) = alert.enrichment.total_reports {
        obj.insert("total_reports".to_string(), json!(reports));
    }
    value
}

/// Emits raised threat hits: severity classification, enrichment, persistence,
/// and fan-out, in that fixed order. Enrichment suspends on blocking HTTP
/// calls but holds no detector state while doing so - the detector has
/// already released the feature by the time a hit reaches here.
pub struct Emitter {
    config: IdsConfig,
    log: Arc<AppendLog>,
    store: Option<Arc<SqliteAlertStore>>,
    reputation: Option<Arc<dyn ReputationProvider>>,
    geo: Option<Arc<dyn GeoProvider>>,
    push_client: reqwest::Client,
    email: Option<SmtpTransport>,
    stats: Arc<EmitterStats>,
    last_alerts: DashMap<uuid::Uuid, Alert>,
}

impl Emitter {
    pub fn new(
        config: IdsConfig,
        log: Arc<AppendLog>,
        store: Option<Arc<SqliteAlertStore>>,
        reputation: Option<Arc<dyn ReputationProvider>>,
        geo: Option<Arc<dyn GeoProvider>>,
    ) -> Self {
        let email = if config.notifications.email.enabled {
            build_smtp_transport(&config).ok()
        } else {
            None
        };

        Self {
            config,
            log,
            store,
            reputation,
            geo,
            push_client: reqwest::Client::new(),
            email,
            stats: Arc::new(EmitterStats::default()),
            last_alerts: DashMap::new(),
        }
    }

    pub fn stats(&self) -> Arc<EmitterStats> {
        Arc::clone(&self.stats)
    }

    /// Most recently emitted alerts, newest first, capped at `limit`. Backed
    /// by an in-memory ring independent of the persistent store so the CLI
    /// can show recent activity even with no `AlertStore` configured.
    pub fn recent_alerts(&self, limit: usize) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.last_alerts.iter().map(|e| e.value().clone()).collect();
        alerts.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        alerts.truncate(limit);
        alerts
    }

    /// Classify, enrich, persist, and fan out a single threat hit.
    pub async fn emit(&self, hit: ThreatHit) -> Alert {
        let mut alert = hit.into_alert();
        alert.enrichment = enrichment::enrich(
            self.reputation.as_deref(),
            self.geo.as_deref(),
            alert.source_ip,
        );

        self.emit_to_log(&alert).await;
        self.emit_to_store(&alert).await;
        self.emit_to_push(&alert).await;
        self.emit_to_notifiers(&alert).await;

        self.last_alerts.insert(alert.id, alert.clone());
        if self.last_alerts.len() > 1000 {
            if let Some(oldest) = self.last_alerts.iter().next().map(|e| *e.key()) {
                self.last_alerts.remove(&oldest);
            }
        }

        alert
    }

    async fn emit_to_log(&self, alert: &Alert) {
        let json = alert_to_json(alert);
        let line = json.to_string();
        if alert.confidence > 0.8 {
            error!(rule = %alert.rule, source_ip = %alert.source_ip, "critical alert");
        } else {
            warn!(rule = %alert.rule, source_ip = %alert.source_ip, "alert raised");
        }
        if let Err(e) = self.log.write(&line).await {
            EmitterStats::bump(&self.stats.log_failures);
            error!(error = %e, "failed to append alert to log");
        }
    }

    async fn emit_to_store(&self, alert: &Alert) {
        let Some(store) = &self.store else { return };
        if let Err(e) = store.add_alert(alert).await {
            EmitterStats::bump(&self.stats.store_failures);
            error!(error = %e, "failed to persist alert");
        }
    }

    async fn emit_to_push(&self, alert: &Alert) {
        if self.config.dashboard.url.is_empty() {
            return;
        }
        let json = alert_to_json(alert);
        let result = self
            .push_client
            .post(&self.config.dashboard.url)
            .json(&json)
            .timeout(Duration::from_millis(500))
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                info!("alert pushed to dashboard");
            }
            Ok(resp) => {
                EmitterStats::bump(&self.stats.push_failures);
                warn!(status = %resp.status(), "dashboard push rejected");
            }
            Err(e) => {
                EmitterStats::bump(&self.stats.push_failures);
                warn!(error = %e, "dashboard push failed");
            }
        }
    }

    async fn emit_to_notifiers(&self, alert: &Alert) {
        if self.config.notifications.email.enabled
            && matches!(alert.severity, Severity::High | Severity::Critical)
        {
            if let Err(e) = self.send_email(alert) {
                EmitterStats::bump(&self.stats.notifier_failures);
                warn!(error = %e, "email notification failed");
            }
        }
        if self.config.notifications.slack.enabled {
            if let Err(e) = self.send_webhook(&self.config.notifications.slack.webhook_url, slack_payload(alert)).await {
                EmitterStats::bump(&self.stats.notifier_failures);
                warn!(error = %e, "slack notification failed");
            }
        }
        if self.config.notifications.discord.enabled {
            if let Err(e) = self.send_webhook(&self.config.notifications.discord.webhook_url, discord_payload(alert)).await {
                EmitterStats::bump(&self.stats.notifier_failures);
                warn!(error = %e, "discord notification failed");
            }
        }
    }

    fn send_email(&self, alert: &Alert) -> anyhow::Result<()> {
        let transport = self
            .email
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("email notifier not configured"))?;
        let cfg = &self.config.notifications.email;
        if cfg.recipients.is_empty() {
            return Err(anyhow::anyhow!("no email recipients configured"));
        }
        let body = format!(
            "IDS Threat Detection\n---------------------\nRule: {}\nSeverity: {}\nConfidence: {:.1}%\nSource: {}\nTarget: {}\nTime: {}\n",
            alert.rule,
            alert.severity,
            alert.confidence * 100.0,
            alert.source_ip,
            alert.target_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "N/A".to_string()),
            alert.timestamp.to_rfc3339(),
        );
        let mut builder = Message::builder()
            .from(cfg.sender.parse()?)
            .subject(format!("[IDS ALERT] {} detected ({})", alert.threat_type, alert.severity));
        for recipient in &cfg.recipients {
            builder = builder.to(recipient.parse()?);
        }
        let message = builder.body(body)?;
        transport.send(&message)?;
        Ok(())
    }

    async fn send_webhook(&self, url: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        if url.is_empty() {
            return Ok(());
        }
        self.push_client
            .post(url)
            .json(&payload)
            .timeout(Duration::from_secs(2))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

fn build_smtp_transport(config: &IdsConfig) -> anyhow::Result<SmtpTransport> {
    let cfg = &config.notifications.email;
    let creds = Credentials::new(cfg.sender.clone(), cfg.password.clone());
    Ok(SmtpTransport::starttls_relay(&cfg.smtp_server)?
        .port(cfg.smtp_port)
        .credentials(creds)
        .build())
}

fn slack_payload(alert: &Alert) -> serde_json::Value {
    let color = if alert.confidence > 0.8 { "#ff0000" } else { "#ffcc00" };
    json!({
        "attachments": [{
            "color": color,
            "title": format!("IDS Alert: {}", alert.threat_type),
            "fields": [
                {"title": "Source IP", "value": alert.source_ip.to_string(), "short": true},
                {"title": "Target IP", "value": alert.target_ip.map(|ip| ip.to_string()).unwrap_or_default(), "short": true},
                {"title": "Confidence", "value": format!("{:.1}%", alert.confidence * 100.0), "short": true},
                {"title": "Severity", "value": alert.severity.to_string(), "short": true},
            ],
            "footer": format!("Rule: {}", alert.rule),
        }]
    })
}

fn discord_payload(alert: &Alert) -> serde_json::Value {
    let color = if alert.confidence > 0.8 { 16_711_680 } else { 16_766_720 };
    json!({
        "embeds": [{
            "title": format!("IDS Alert: {}", alert.threat_type),
            "color": color,
            "fields": [
                {"name": "Source IP", "value": alert.source_ip.to_string(), "inline": true},
                {"name": "Target IP", "value": alert.target_ip.map(|ip| ip.to_string()).unwrap_or_default(), "inline": true},
                {"name": "Confidence", "value": format!("{:.1}%", alert.confidence * 100.0), "inline": true},
                {"name": "Severity", "value": alert.severity.to_string(), "inline": true},
            ],
            "timestamp": alert.timestamp.to_rfc3339(),
        }]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::ThreatHit;
    use crate::types::ThreatType;

    fn sample_hit() -> ThreatHit {
        ThreatHit {
            rule: "port_scan",
            threat_type: ThreatType::PortScan,
            confidence: 0.95,
            source_ip: "10.0.0.5".parse().unwrap(),
            target_ip: Some("10.0.0.1".parse().unwrap()),
            affected_ports: vec![22, 80],
            description: "test scan".to_string(),
        }
    }

    #[tokio::test]
    async fn emit_writes_to_log_and_persists() {
        let dir = std::env::temp_dir().join(format!("ids-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log_path = dir.join("alerts.log");
        let log = Arc::new(AppendLog::open(log_path.to_str().unwrap()).await.unwrap());
        let store = Arc::new(SqliteAlertStore::connect(":memory:").await.unwrap());

        let emitter = Emitter::new(IdsConfig::default(), log, Some(store.clone()), None, None);
        let alert = emitter.emit(sample_hit()).await;

        assert_eq!(alert.severity, Severity::Critical);
        let recent = store.recent_alerts(10).await.unwrap();
        assert_eq!(recent.len(), 1);

        let contents = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(contents.lines().count(), 1);
        let parsed: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed["source_ip"], "10.0.0.5");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn emit_survives_dashboard_outage() {
        let dir = std::env::temp_dir().join(format!("ids-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let log_path = dir.join("alerts.log");
        let log = Arc::new(AppendLog::open(log_path.to_str().unwrap()).await.unwrap());

        let mut config = IdsConfig::default();
        config.dashboard.url = "http://127.0.0.1:1/unreachable".to_string();

        let emitter = Emitter::new(config, log, None, None, None);
        let alert = emitter.emit(sample_hit()).await;
        assert_eq!(alert.rule, "port_scan");
        assert!(emitter.stats().push_failures.load(std::sync::atomic::Ordering::Relaxed) >= 1);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn alert_json_omits_enrichment_when_absent() {
        let alert = sample_hit().into_alert();
        let json = alert_to_json(&alert);
        assert!(json.get("abuse_score").is_none());
        assert_eq!(json["severity"], "critical");
    }
}
