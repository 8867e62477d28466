//! # Network IDS core
//!
//! The detection pipeline: capture -> analyze -> detect -> enrich -> emit.
//! `NetworkIds` wires the individually-testable modules together into the
//! two-task pipeline the concurrency model describes: a capture producer and
//! an analyzer+detector consumer communicating only through a bounded
//! channel, plus an independent emitter task so a slow sink never
//! backpressures detection.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod alerting;
pub mod analyzer;
pub mod capture;
pub mod config;
pub mod detector;
pub mod enrichment;
pub mod error;
pub mod ml;
pub mod store;
pub mod types;
pub mod utils;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerting::{AppendLog, Emitter, EmitterStats};
use crate::capture::{CaptureSource, DropCounter, PcapCapture, SimulatedCapture};
use crate::config::IdsConfig;
use crate::detector::Detector;
use crate::enrichment::{AbuseIpDbProvider, GeoProvider, IpApiProvider, ReputationProvider};
use crate::ml::AnomalyScorer;
use crate::store::SqliteAlertStore;
use crate::types::{Alert, AlertSinkFailures, Packet, SystemStats};

/// Queue depth between the analyzer/detector and the emitter. Its own
/// bounded, tail-drop queue per the concurrency model's requirement that
/// fan-out "MAY run as additional concurrent units" without ever
/// backpressuring detection.
const ALERT_QUEUE_CAPACITY: usize = 1000;

/// Top-level orchestrator: owns the shared config and stats, and spawns the
/// capture/detection/emission tasks on `start`.
pub struct NetworkIds {
    config: Arc<IdsConfig>,
    stats: Arc<parking_lot::RwLock<SystemStats>>,
    alert_sender: broadcast::Sender<Alert>,
    _alert_receiver: broadcast::Receiver<Alert>,
    shutdown_token: CancellationToken,
    drop_counter: Arc<DropCounter>,
    emitter_stats: Arc<parking_lot::Mutex<Option<Arc<EmitterStats>>>>,
    emitter: Arc<tokio::sync::Mutex<Option<Arc<Emitter>>>>,
}

impl NetworkIds {
    pub fn new(config: IdsConfig) -> Result<Self> {
        info!("creating NetworkIds instance");
        let (alert_sender, alert_receiver) = broadcast::channel(1000);
        Ok(Self {
            config: Arc::new(config),
            stats: Arc::new(parking_lot::RwLock::new(SystemStats::new())),
            alert_sender,
            _alert_receiver: alert_receiver,
            shutdown_token: CancellationToken::new(),
            drop_counter: Arc::new(DropCounter::default()),
            emitter_stats: Arc::new(parking_lot::Mutex::new(None)),
            emitter: Arc::new(tokio::sync::Mutex::new(None)),
        })
    }

    /// Builds the enrichment providers, persistent store, and anomaly
    /// scorer the detector/emitter need, then spawns the capture, detection,
    /// and emission tasks. Returns once every task has been spawned; it does
    /// not block for the pipeline's lifetime.
    pub async fn start(&mut self) -> Result<()> {
        info!("starting network ids pipeline");

        let reputation: Option<Arc<dyn ReputationProvider>> =
            if self.config.threat_intelligence.abuseipdb.enabled
                && !self.config.threat_intelligence.abuseipdb.api_key.is_empty()
            {
                Some(Arc::new(AbuseIpDbProvider::new(&self.config)))
            } else {
                None
            };
        let geo: Option<Arc<dyn GeoProvider>> = if self.config.geolocation.enabled {
            Some(Arc::new(IpApiProvider::new(&self.config)))
        } else {
            None
        };

        let store = match SqliteAlertStore::connect(&self.config.database.path).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "failed to open alert store, continuing without persistence");
                None
            }
        };

        let log = Arc::new(
            AppendLog::open(&self.config.alerting.log_path)
                .await
                .context("opening alert append log")?,
        );

        let emitter = Arc::new(Emitter::new(
            (*self.config).clone(),
            log,
            store,
            reputation,
            geo,
        ));
        *self.emitter_stats.lock() = Some(emitter.stats());
        *self.emitter.lock().await = Some(Arc::clone(&emitter));

        let (packet_tx, packet_rx) = mpsc::channel::<Packet>(self.config.capture.queue_capacity);
        let (hit_tx, mut hit_rx) = mpsc::channel::<detector::ThreatHit>(ALERT_QUEUE_CAPACITY);

        self.spawn_capture_task(packet_tx);
        self.spawn_detection_task(packet_rx, hit_tx);

        let emitter_shutdown = self.shutdown_token.clone();
        let stats = Arc::clone(&self.stats);
        let alert_sender = self.alert_sender.clone();
        tokio::spawn(async move {
            info!("emitter task started");
            loop {
                tokio::select! {
                    hit = hit_rx.recv() => {
                        match hit {
                            Some(hit) => {
                                let alert = emitter.emit(hit).await;
                                {
                                    let mut stats = stats.write();
                                    stats.increment_threat_count(alert.severity);
                                }
                                let _ = alert_sender.send(alert);
                            }
                            None => {
                                info!("hit channel closed, emitter task exiting");
                                break;
                            }
                        }
                    }
                    () = emitter_shutdown.cancelled() => {
                        info!("emitter task shutting down");
                        break;
                    }
                }
            }
        });

        self.spawn_stats_monitor();
        self.spawn_system_stats_monitor();

        info!("network ids pipeline started");
        Ok(())
    }

    fn spawn_capture_task(&self, packet_tx: mpsc::Sender<Packet>) {
        let config = Arc::clone(&self.config);
        let drops = Arc::clone(&self.drop_counter);
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            let source = if config.capture.use_simulation {
                info!("starting simulated capture");
                CaptureSource::Simulated(SimulatedCapture)
            } else {
                match PcapCapture::new(&config) {
                    Ok(capture) => {
                        info!("starting pcap capture");
                        CaptureSource::Pcap(capture)
                    }
                    Err(e) => {
                        warn!(error = %e, "pcap capture unavailable, falling back to simulation");
                        CaptureSource::Simulated(SimulatedCapture)
                    }
                }
            };

            tokio::select! {
                result = source.run(packet_tx, Arc::clone(&drops)) => {
                    if let Err(e) = result {
                        error!(error = %e, "capture task failed");
                    }
                }
                () = shutdown.cancelled() => {
                    info!("capture task shutting down");
                }
            }
            stats.write().record_dropped(drops.get());
        });
    }

    fn spawn_detection_task(
        &self,
        mut packet_rx: mpsc::Receiver<Packet>,
        hit_tx: mpsc::Sender<detector::ThreatHit>,
    ) {
        let config = (*self.config).clone();
        let stats = Arc::clone(&self.stats);
        let drops = Arc::clone(&self.drop_counter);
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            info!("analyzer/detector task started");
            let mut analyzer = analyzer::Analyzer::new(config.flow_idle_timeout());
            let scorer: Option<Box<dyn AnomalyScorer>> = None;
            let mut detector = Detector::new(config, scorer);

            loop {
                tokio::select! {
                    packet = packet_rx.recv() => {
                        match packet {
                            Some(packet) => {
                                {
                                    let mut stats = stats.write();
                                    stats.update_packet_stats(packet.size as u64, packet.protocol);
                                    stats.active_flows = analyzer.active_flow_count() as u32;
                                    stats.packets_dropped = drops.get();
                                }
                                if let Some(feature) = analyzer.analyze(&packet) {
                                    for hit in detector.detect(&feature) {
                                        if hit_tx.try_send(hit).is_err() {
                                            debug!("alert queue full, dropping threat hit");
                                        }
                                    }
                                }
                            }
                            None => {
                                info!("packet channel closed, detection task exiting");
                                break;
                            }
                        }
                    }
                    () = shutdown.cancelled() => {
                        info!("detection task draining before shutdown");
                        while let Ok(packet) = packet_rx.try_recv() {
                            if let Some(feature) = analyzer.analyze(&packet) {
                                for hit in detector.detect(&feature) {
                                    let _ = hit_tx.try_send(hit);
                                }
                            }
                        }
                        break;
                    }
                }
            }
        });
    }

    fn spawn_stats_monitor(&self) {
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let s = stats.read();
                        info!(
                            packets = s.packets_processed,
                            bytes = s.bytes_processed,
                            dropped = s.packets_dropped,
                            threats = s.threats_detected,
                            rate = s.processing_rate,
                            flows = s.active_flows,
                            "pipeline stats"
                        );
                    }
                    () = shutdown.cancelled() => {
                        info!("stats monitor shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Samples this process's CPU/memory via `sysinfo` into `SystemStats`,
    /// the same per-process sampling approach the teacher's stats updater
    /// uses, on its own 2s cadence independent of the pipeline stats log.
    fn spawn_system_stats_monitor(&self) {
        let stats = Arc::clone(&self.stats);
        let shutdown = self.shutdown_token.clone();
        tokio::spawn(async move {
            let mut sys = sysinfo::System::new_all();
            let pid = match sysinfo::get_current_pid() {
                Ok(pid) => pid,
                Err(e) => {
                    warn!(error = %e, "failed to resolve current pid, system stats disabled");
                    return;
                }
            };
            sys.refresh_process(pid);

            let mut interval = tokio::time::interval(std::time::Duration::from_secs(2));
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        sys.refresh_process(pid);
                        sys.refresh_memory();

                        let cpu = sys.process(pid).map(|p| p.cpu_usage()).unwrap_or(0.0);
                        let used_mem_bytes = sys.used_memory() * 1024;

                        let mut s = stats.write();
                        s.cpu_usage = cpu;
                        s.memory_usage = used_mem_bytes;
                    }
                    () = shutdown.cancelled() => {
                        info!("system stats monitor shutting down");
                        break;
                    }
                }
            }
        });
    }

    /// Cancels all pipeline tasks. Idempotent: cancelling an
    /// already-cancelled token is a no-op per `tokio_util`'s contract.
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn get_stats(&self) -> SystemStats {
        let mut stats = self.stats.read().clone();
        if let Some(emitter_stats) = self.emitter_stats.lock().as_ref() {
            stats.alert_sink_failures = AlertSinkFailures::from(emitter_stats.as_ref());
        }
        stats
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<Alert> {
        self.alert_sender.subscribe()
    }

    pub async fn get_recent_alerts(&self, limit: usize) -> Vec<Alert> {
        match self.emitter.lock().await.as_ref() {
            Some(emitter) => emitter.recent_alerts(limit),
            None => Vec::new(),
        }
    }

    pub fn config(&self) -> &IdsConfig {
        &self.config
    }
}

impl From<&EmitterStats> for AlertSinkFailures {
    fn from(stats: &EmitterStats) -> Self {
        Self {
            log: stats.log_failures.load(Ordering::Relaxed),
            store: stats.store_failures.load(Ordering::Relaxed),
            push: stats.push_failures.load(Ordering::Relaxed),
            notifiers: stats.notifier_failures.load(Ordering::Relaxed),
        }
    }
}
