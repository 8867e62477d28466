//! Persisted alert storage backed by SQLite.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::{IdsError, Result};
use crate::types::{Alert, Enrichment, Severity, ThreatType};

fn threat_type_str(t: ThreatType) -> &'static str {
    match t {
        ThreatType::PortScan => "port_scan",
        ThreatType::SynFlood => "syn_flood",
        ThreatType::Ddos => "ddos",
        ThreatType::Anomalous => "anomalous",
        ThreatType::Suspicious => "suspicious",
    }
}

fn parse_threat_type(s: &str) -> ThreatType {
    match s {
        "port_scan" => ThreatType::PortScan,
        "syn_flood" => ThreatType::SynFlood,
        "ddos" => ThreatType::Ddos,
        "anomalous" => ThreatType::Anomalous,
        _ => ThreatType::Suspicious,
    }
}

/// SQLite-backed alert store. Owns its own pool; `init` is idempotent and
/// must run once before `add_alert`/`recent_alerts` are called.
pub struct SqliteAlertStore {
    pool: SqlitePool,
}

impl SqliteAlertStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path == ":memory:" {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{}?mode=rwc", path)
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id TEXT PRIMARY KEY,
                timestamp TEXT NOT NULL,
                threat_type TEXT NOT NULL,
                rule TEXT NOT NULL,
                source_ip TEXT NOT NULL,
                target_ip TEXT,
                confidence REAL NOT NULL,
                severity TEXT NOT NULL,
                description TEXT NOT NULL,
                affected_ports TEXT NOT NULL,
                abuse_score INTEGER,
                is_known_threat INTEGER,
                total_reports INTEGER,
                threat_categories TEXT,
                country TEXT,
                city TEXT,
                isp TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON alerts(timestamp DESC)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts(severity, timestamp DESC)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn add_alert(&self, alert: &Alert) -> Result<()> {
        let affected_ports = serde_json::to_string(&alert.affected_ports)?;
        let threat_categories = serde_json::to_string(&alert.enrichment.threat_categories)?;

        sqlx::query(
            r#"
            INSERT INTO alerts (
                id, timestamp, threat_type, rule, source_ip, target_ip,
                confidence, severity, description, affected_ports,
                abuse_score, is_known_threat, total_reports, threat_categories, country, city, isp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(alert.id.to_string())
        .bind(alert.timestamp.to_rfc3339())
        .bind(threat_type_str(alert.threat_type))
        .bind(&alert.rule)
        .bind(alert.source_ip.to_string())
        .bind(alert.target_ip.map(|ip| ip.to_string()))
        .bind(alert.confidence)
        .bind(alert.severity.to_string())
        .bind(&alert.description)
        .bind(affected_ports)
        .bind(alert.enrichment.abuse_score.map(|v| v as i64))
        .bind(alert.enrichment.is_known_threat)
        .bind(alert.enrichment.total_reports.map(|v| v as i64))
        .bind(threat_categories)
        .bind(&alert.enrichment.country)
        .bind(&alert.enrichment.city)
        .bind(&alert.enrichment.isp)
        .execute(&self.pool)
        .await
        .map_err(IdsError::Database)?;

        Ok(())
    }

    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows: Vec<(
            String,
            String,
            String,
            String,
            String,
            Option<String>,
            f32,
            String,
            String,
            String,
            Option<i64>,
            Option<bool>,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
        )> = sqlx::query_as(
            r#"
            SELECT id, timestamp, threat_type, rule, source_ip, target_ip,
                   confidence, severity, description, affected_ports,
                   abuse_score, is_known_threat, total_reports, threat_categories, country, city, isp
            FROM alerts
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut alerts = Vec::with_capacity(rows.len());
        for (
            id,
            timestamp,
            threat_type,
            rule,
            source_ip,
            target_ip,
            confidence,
            severity,
            description,
            affected_ports,
            abuse_score,
            is_known_threat,
            total_reports,
            threat_categories,
            country,
            city,
            isp,
        ) in rows
        {
            alerts.push(Alert {
                id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
                timestamp: DateTime::parse_from_rfc3339(&timestamp)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                rule,
                threat_type: parse_threat_type(&threat_type),
                confidence,
                severity: match severity.as_str() {
                    "critical" => Severity::Critical,
                    "high" => Severity::High,
                    "medium" => Severity::Medium,
                    _ => Severity::Low,
                },
                source_ip: source_ip.parse().unwrap_or_else(|_| "0.0.0.0".parse().unwrap()),
                target_ip: target_ip.and_then(|ip| ip.parse().ok()),
                affected_ports: serde_json::from_str(&affected_ports).unwrap_or_default(),
                description,
                enrichment: Enrichment {
                    abuse_score: abuse_score.map(|v| v as u8),
                    is_known_threat,
                    total_reports: total_reports.map(|v| v as u32),
                    threat_categories: threat_categories
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_default(),
                    country,
                    city,
                    isp,
                },
            });
        }
        Ok(alerts)
    }

    pub async fn alert_counts_by_threat_type(&self) -> Result<Vec<(String, i64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT threat_type, COUNT(*) FROM alerts GROUP BY threat_type")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Alert, Enrichment, Severity, ThreatType};

    fn sample_alert() -> Alert {
        Alert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            rule: "port_scan".to_string(),
            threat_type: ThreatType::PortScan,
            confidence: 0.9,
            severity: Severity::High,
            source_ip: "10.0.0.5".parse().unwrap(),
            target_ip: Some("10.0.0.1".parse().unwrap()),
            affected_ports: vec![22, 80, 443],
            description: "test alert".to_string(),
            enrichment: Enrichment::default(),
        }
    }

    #[tokio::test]
    async fn add_and_fetch_roundtrips() {
        let store = SqliteAlertStore::connect(":memory:").await.expect("connect");
        let alert = sample_alert();
        store.add_alert(&alert).await.expect("insert");

        let recent = store.recent_alerts(10).await.expect("fetch");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source_ip, alert.source_ip);
        assert_eq!(recent[0].affected_ports, alert.affected_ports);
    }

    #[tokio::test]
    async fn counts_group_by_threat_type() {
        let store = SqliteAlertStore::connect(":memory:").await.expect("connect");
        store.add_alert(&sample_alert()).await.expect("insert");
        let mut alert2 = sample_alert();
        alert2.threat_type = ThreatType::Ddos;
        store.add_alert(&alert2).await.expect("insert");

        let counts = store.alert_counts_by_threat_type().await.expect("counts");
        assert_eq!(counts.len(), 2);
    }
}
