//! Interactive command-line interface for Network IDS

use anyhow::Result;
use clap::Parser;
use colored::*;
use network_ids_core::config::IdsConfig;
use network_ids_core::types::{Alert, Severity, SystemStats};
use network_ids_core::utils::format_bytes;
use network_ids_core::NetworkIds;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{error, Level};

#[derive(Parser)]
#[command(name = "network-ids")]
#[command(about = "Network Intrusion Detection System - Interactive CLI")]
#[command(version = "1.0.0")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<String>,
}

struct IdsSession {
    ids: Option<Arc<Mutex<NetworkIds>>>,
    config_path: Option<String>,
    running: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(false)
        .init();

    let cli = Cli::parse();

    print_banner();

    let session = Arc::new(Mutex::new(IdsSession {
        ids: None,
        config_path: cli.config,
        running: false,
    }));

    run_interactive_shell(session).await
}

fn print_banner() {
    println!("{}", "╔════════════════════════════════════════════════════════╗".bright_cyan());
    println!("{}", "║         Network Intrusion Detection System               ║".bright_cyan());
    println!("{}", "╚════════════════════════════════════════════════════════╝".bright_cyan());
    println!();
    println!("{}", "Type 'help' for available commands, 'exit' to quit".bright_black());
    println!();
}

async fn run_interactive_shell(session: Arc<Mutex<IdsSession>>) -> Result<()> {
    let stdin = tokio::io::stdin();
    let mut reader = BufReader::new(stdin).lines();

    loop {
        let running = session.lock().await.running;
        let prompt = if running {
            format!("{} ", "ids>".bright_green().bold())
        } else {
            format!("{} ", "ids>".bright_red().bold())
        };

        print!("{}", prompt);
        use std::io::Write;
        std::io::stdout().flush()?;

        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("failed to read line: {}", e);
                continue;
            }
        };

        let command = line.trim();
        if command.is_empty() {
            continue;
        }

        match handle_command(command, Arc::clone(&session)).await {
            Ok(should_exit) => {
                if should_exit {
                    break;
                }
            }
            Err(e) => {
                println!("{} {}", "Error:".bright_red().bold(), e);
            }
        }
    }

    println!("\n{}", "Shutting down...".yellow());
    let mut sess = session.lock().await;
    if let Some(ids) = &sess.ids {
        let ids_locked = ids.lock().await;
        ids_locked.shutdown();
    }
    sess.ids = None;
    sess.running = false;

    println!("{}", "Goodbye!".bright_green());
    Ok(())
}

async fn handle_command(command: &str, session: Arc<Mutex<IdsSession>>) -> Result<bool> {
    let parts: Vec<&str> = command.split_whitespace().collect();
    if parts.is_empty() {
        return Ok(false);
    }

    match parts[0] {
        "help" | "h" | "?" => print_help(),
        "start" => start_ids(session, &parts[1..]).await?,
        "stop" => stop_ids(session).await?,
        "status" | "s" => show_status(session).await?,
        "stats" => show_stats(session, &parts[1..]).await?,
        "alerts" => show_alerts(session, &parts[1..]).await?,
        "clear" | "cls" => {
            print!("\x1B[2J\x1B[1;1H");
            print_banner();
        }
        "exit" | "quit" | "q" => return Ok(true),
        _ => {
            println!("{} unknown command: '{}'", "Error:".bright_red().bold(), parts[0]);
            println!("Type 'help' for available commands");
        }
    }

    Ok(false)
}

fn print_help() {
    println!("\n{}", "Available Commands:".bright_cyan().bold());
    println!();
    println!("  {}              Start the IDS pipeline", "start".bright_green());
    println!("                       Options: --simulate (use simulated traffic)");
    println!();
    println!("  {}               Stop the IDS pipeline", "stop".bright_green());
    println!();
    println!("  {}             Show system status", "status".bright_green());
    println!();
    println!("  {}              Show system statistics", "stats".bright_green());
    println!("                       Options: --live (continuous updates)");
    println!("                                --protocols (protocol distribution)");
    println!("                                --threats (threat breakdown)");
    println!();
    println!("  {}             Show recent alerts", "alerts".bright_green());
    println!("                       Options: --limit <n> (show n alerts)");
    println!("                                --critical (only critical)");
    println!("                                --high (high and above)");
    println!();
    println!("  {}              Clear screen", "clear".bright_green());
    println!();
    println!("  {}               Exit the CLI", "exit".bright_green());
    println!();
}

async fn start_ids(session: Arc<Mutex<IdsSession>>, args: &[&str]) -> Result<()> {
    let mut sess = session.lock().await;

    if sess.running {
        println!("{}", "IDS is already running!".yellow());
        return Ok(());
    }

    let simulate = args.contains(&"--simulate");

    println!("{}", "Starting IDS...".bright_cyan());

    let mut config = IdsConfig::load(sess.config_path.as_deref())?;
    if simulate {
        config.capture.use_simulation = true;
    }

    let mut ids = NetworkIds::new(config)?;

    let alert_receiver = ids.subscribe_alerts();
    tokio::spawn(async move {
        handle_alerts(alert_receiver).await;
    });

    ids.start().await?;

    sess.ids = Some(Arc::new(Mutex::new(ids)));
    sess.running = true;

    println!("{}", "IDS started successfully".bright_green());
    if simulate {
        println!("{}", "  Mode: Simulation".bright_black());
    }

    Ok(())
}

async fn handle_alerts(mut receiver: tokio::sync::broadcast::Receiver<Alert>) {
    while let Ok(alert) = receiver.recv().await {
        let severity_color = match alert.severity {
            Severity::Critical => "red",
            Severity::High => "yellow",
            Severity::Medium => "blue",
            Severity::Low => "white",
        };

        let severity_str = format!("{}", alert.severity).color(severity_color).bold();
        println!(
            "\n{} {} {} from {}",
            "!".bright_red(),
            severity_str,
            alert.threat_type.to_string().bright_white().bold(),
            alert.source_ip.to_string().bright_cyan()
        );
        println!("   {}", alert.description.bright_black());
        print!("\nids> ");
        use std::io::Write;
        std::io::stdout().flush().ok();
    }
}

async fn stop_ids(session: Arc<Mutex<IdsSession>>) -> Result<()> {
    let mut sess = session.lock().await;

    if !sess.running {
        println!("{}", "IDS is not running".yellow());
        return Ok(());
    }

    println!("{}", "Stopping IDS...".bright_cyan());

    if let Some(ids) = &sess.ids {
        let ids_locked = ids.lock().await;
        ids_locked.shutdown();
    }

    sess.ids = None;
    sess.running = false;

    println!("{}", "IDS stopped".bright_green());

    Ok(())
}

async fn show_status(session: Arc<Mutex<IdsSession>>) -> Result<()> {
    let sess = session.lock().await;

    println!("\n{}", "System Status:".bright_cyan().bold());
    println!("{}", "=".repeat(50).bright_black());

    if sess.running {
        println!("Status: {}", "Running".bright_green().bold());

        if let Some(ids) = &sess.ids {
            let ids_locked = ids.lock().await;
            let stats = ids_locked.get_stats();

            println!(
                "Uptime: {} seconds",
                (chrono::Utc::now() - stats.start_time)
                    .num_seconds()
                    .to_string()
                    .bright_white()
            );
            println!("Packets: {}", stats.packets_processed.to_string().bright_white());
            println!("Threats: {}", stats.threats_detected.to_string().bright_red());
        }
    } else {
        println!("Status: {}", "Stopped".bright_red().bold());
    }

    println!("Version: {}", env!("CARGO_PKG_VERSION").bright_white());
    println!();

    Ok(())
}

async fn show_stats(session: Arc<Mutex<IdsSession>>, args: &[&str]) -> Result<()> {
    let sess = session.lock().await;

    if !sess.running {
        println!("{}", "IDS is not running. Start it with 'start'".yellow());
        return Ok(());
    }

    let ids = sess.ids.as_ref().ok_or_else(|| anyhow::anyhow!("no IDS instance"))?;
    let ids = Arc::clone(ids);

    let live = args.contains(&"--live");
    let show_protocols = args.contains(&"--protocols");
    let show_threats = args.contains(&"--threats");

    if live {
        println!("{}", "Live stats (Ctrl+C to stop):".bright_cyan().bold());
        println!();

        drop(sess);

        loop {
            let sess = session.lock().await;
            if !sess.running {
                break;
            }
            drop(sess);

            let stats = ids.lock().await.get_stats();

            print!(
                "\r Packets: {} | Threats: {} | Rate: {:.2} pps   ",
                stats.packets_processed.to_string().bright_white(),
                stats.threats_detected.to_string().bright_red(),
                stats.processing_rate
            );

            use std::io::Write;
            std::io::stdout().flush()?;

            tokio::time::sleep(tokio::time::Duration::from_secs(1)).await;
        }
        println!();
    } else {
        let stats = ids.lock().await.get_stats();
        print_stats(&stats, show_protocols, show_threats);
    }

    Ok(())
}

fn print_stats(stats: &SystemStats, show_protocols: bool, show_threats: bool) {
    println!("\n{}", "System Statistics:".bright_cyan().bold());
    println!("{}", "=".repeat(50).bright_black());

    println!("Packets Processed: {}", stats.packets_processed.to_string().bright_white());
    println!("Bytes Processed:   {}", format_bytes(stats.bytes_processed).bright_white());
    println!("Packets Dropped:   {}", stats.packets_dropped.to_string().bright_yellow());
    println!("Threats Detected:  {}", stats.threats_detected.to_string().bright_red());
    println!("Active Flows:      {}", stats.active_flows.to_string().bright_white());
    println!(
        "Processing Rate:   {} pps",
        format!("{:.2}", stats.processing_rate).bright_green()
    );
    println!("CPU Usage:         {}%", format!("{:.1}", stats.cpu_usage).bright_yellow());
    println!("Memory Usage:      {}", format_bytes(stats.memory_usage).bright_yellow());

    let failures = &stats.alert_sink_failures;
    if failures.log + failures.store + failures.push + failures.notifiers > 0 {
        println!("\n{}", "Alert Sink Failures:".bright_cyan());
        println!("  log: {}  store: {}  push: {}  notifiers: {}", failures.log, failures.store, failures.push, failures.notifiers);
    }

    if show_protocols {
        println!("\n{}", "Protocol Distribution:".bright_cyan());
        for (protocol, count) in &stats.protocol_distribution {
            println!("  {}: {}", protocol.to_string().bright_white(), count.to_string().bright_black());
        }
    }

    if show_threats {
        println!("\n{}", "Threat Breakdown:".bright_cyan());
        for (severity, count) in &stats.alert_counts {
            let color = severity_color(*severity);
            println!("  {}: {}", severity.to_string().color(color), count.to_string().bright_black());
        }
    }

    println!();
}

async fn show_alerts(session: Arc<Mutex<IdsSession>>, args: &[&str]) -> Result<()> {
    let sess = session.lock().await;

    if !sess.running {
        println!("{}", "IDS is not running. Start it with 'start'".yellow());
        return Ok(());
    }

    let ids = sess.ids.as_ref().ok_or_else(|| anyhow::anyhow!("no IDS instance"))?;
    let ids = Arc::clone(ids);
    drop(sess);

    let mut limit = 10;
    let mut filter_severity: Option<Severity> = None;

    for (i, arg) in args.iter().enumerate() {
        match *arg {
            "--limit" => {
                if let Some(n) = args.get(i + 1) {
                    limit = n.parse().unwrap_or(10);
                }
            }
            "--critical" => filter_severity = Some(Severity::Critical),
            "--high" => filter_severity = Some(Severity::High),
            _ => {}
        }
    }

    let all_alerts = ids.lock().await.get_recent_alerts(100).await;
    let filtered_alerts: Vec<_> = if let Some(min_severity) = filter_severity {
        all_alerts
            .into_iter()
            .filter(|a| a.severity >= min_severity)
            .take(limit)
            .collect()
    } else {
        all_alerts.into_iter().take(limit).collect()
    };

    if filtered_alerts.is_empty() {
        println!("{}", "No alerts to display".bright_black());
        return Ok(());
    }

    println!("\n{} (showing {})", "Recent Alerts:".bright_cyan().bold(), filtered_alerts.len());
    println!("{}", "=".repeat(70).bright_black());

    for (i, alert) in filtered_alerts.iter().enumerate() {
        let color = severity_color(alert.severity);

        println!(
            "\n{} {} {}",
            format!("{}.", i + 1).bright_black(),
            alert.severity.to_string().color(color).bold(),
            alert.threat_type.to_string().bright_white().bold()
        );
        println!(
            "   From: {} -> {}",
            alert.source_ip.to_string().bright_cyan(),
            alert
                .target_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "N/A".to_string())
                .bright_cyan()
        );
        println!("   {}", alert.description.bright_black());
        println!("   Confidence: {}%", (alert.confidence * 100.0).round().to_string().bright_green());
    }

    println!();

    Ok(())
}

fn severity_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Critical => "red",
        Severity::High => "yellow",
        Severity::Medium => "blue",
        Severity::Low => "white",
    }
}
