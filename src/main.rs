mod keybindings;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::{
    event::{self, DisableMouseCapture, EnableMouseCapture, Event, KeyCode, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{Terminal, backend::CrosstermBackend};
use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::time::interval;

use crate::ui::{AppState, SortColumn};
use xnettop::backends::detect_backends;
use xnettop::{MonitorConfig, NetworkMonitor, ProcessStats};

/// How long a user action's status message stays before the periodic summary replaces it
const STATUS_HOLD: Duration = Duration::from_secs(3);

/// xnettop - per-process network traffic monitor
#[derive(Parser, Debug)]
#[command(name = "xnettop")]
#[command(version)]
#[command(about = "Network traffic monitor by process - attributes live packets to the process that owns the socket", long_about = None)]
struct Args {
    /// Network interface to capture on (default: all)
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// UI refresh rate in seconds (default: 1.0)
    #[arg(short, long, value_name = "SECONDS")]
    refresh: Option<f64>,

    /// Connection table refresh rate in seconds (default: 1.0)
    #[arg(short, long, value_name = "SECONDS")]
    connection_refresh: Option<f64>,

    /// Attribution cycle interval in seconds (default: 0.5)
    #[arg(long, value_name = "SECONDS")]
    update_interval: Option<f64>,

    /// Sliding window for rate calculation in seconds (default: 2.0)
    #[arg(long, value_name = "SECONDS")]
    window: Option<f64>,

    /// Maximum packets buffered between capture and attribution (default: 10000)
    #[arg(long, value_name = "PACKETS")]
    queue_capacity: Option<usize>,

    /// Config file (default: ~/.config/xnettop/config.json)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Capture for this many seconds, print one snapshot and exit (skips TUI)
    #[arg(long, value_name = "SECONDS")]
    snapshot: Option<f64>,

    /// Print the snapshot as JSON - requires --snapshot
    #[arg(long, requires = "snapshot")]
    json: bool,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,
}

impl Args {
    /// Config file values, overridden by any flag given on the command line
    fn to_config(&self) -> Result<MonitorConfig> {
        let mut config = match &self.config {
            Some(path) => MonitorConfig::load_from(path)?,
            None => MonitorConfig::load()?,
        };

        if let Some(interface) = &self.interface {
            config.interface = Some(interface.clone());
        }
        if let Some(refresh) = self.refresh {
            config.ui_refresh_secs = refresh;
        }
        if let Some(refresh) = self.connection_refresh {
            config.socket_refresh_secs = refresh;
        }
        if let Some(interval) = self.update_interval {
            config.aggregate_interval_secs = interval;
        }
        if let Some(window) = self.window {
            config.rate_window_secs = window;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }

        config.validate().context("Invalid options")?;
        Ok(config)
    }
}

fn print_available_backends() {
    println!("xnettop v{} - Available Backends\n", env!("CARGO_PKG_VERSION"));

    for kind in ["capture", "socket"] {
        println!("{} backends:", kind);
        let backends: Vec<_> = detect_backends()
            .into_iter()
            .filter(|b| b.kind == kind)
            .collect();
        if backends.is_empty() {
            println!("  (none compiled in)");
        }
        for backend in backends {
            let status = if backend.available {
                "✅ available"
            } else {
                "❌ unavailable"
            };
            println!("  {:20} {}", backend.name, status);
        }
        println!();
    }
}

fn check_root() -> Result<()> {
    #[cfg(unix)]
    {
        if !nix::unistd::geteuid().is_root() {
            anyhow::bail!(
                "xnettop requires root privileges for packet capture.\nPlease run with: sudo xnettop"
            );
        }
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => log::warn!("Failed to install SIGTERM handler: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::warn!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}

#[derive(Serialize)]
struct SnapshotReport<'a> {
    timestamp: String,
    interface: &'a str,
    duration_secs: f64,
    connections: usize,
    dropped_packets: u64,
    loopback_skipped: u64,
    processes: Vec<ProcessStats>,
}

fn print_snapshot_table(report: &SnapshotReport) {
    println!(
        "xnettop snapshot at {} on {} ({:.1}s, {} connections, {} dropped)",
        report.timestamp,
        report.interface,
        report.duration_secs,
        report.connections,
        report.dropped_packets
    );
    println!();
    println!(
        "{:<24} {:>7} {:>12} {:>12} {:>12} {:>10} {:>10}",
        "Process", "PID", "Download", "Upload", "Total", "Total Down", "Total Up"
    );
    for process in &report.processes {
        let pid = if process.is_unknown() {
            "?".to_string()
        } else {
            process.pid.to_string()
        };
        println!(
            "{:<24} {:>7} {:>12} {:>12} {:>12} {:>10} {:>10}",
            process.name.chars().take(24).collect::<String>(),
            pid,
            ProcessStats::format_rate(process.download_rate),
            ProcessStats::format_rate(process.upload_rate),
            ProcessStats::format_rate(process.total_rate()),
            ProcessStats::format_bytes(process.download_bytes),
            ProcessStats::format_bytes(process.upload_bytes),
        );
    }
    if report.processes.is_empty() {
        println!("(no traffic observed)");
    }
}

/// Capture for a fixed duration, then print what was seen
async fn run_snapshot_mode(monitor: &NetworkMonitor, seconds: f64, json: bool) -> Result<()> {
    if !seconds.is_finite() || seconds <= 0.0 {
        anyhow::bail!("--snapshot must be a positive number of seconds, got {}", seconds);
    }

    let started = Instant::now();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
        _ = shutdown_signal() => {
            log::info!("Interrupted, printing partial snapshot");
        }
    }

    let report = SnapshotReport {
        timestamp: chrono::Local::now().to_rfc3339(),
        interface: monitor
            .config()
            .interface
            .as_deref()
            .unwrap_or("all interfaces"),
        duration_secs: started.elapsed().as_secs_f64(),
        connections: monitor.connection_count(),
        dropped_packets: monitor.dropped_packets(),
        loopback_skipped: monitor.loopback_skipped(),
        processes: monitor.get_snapshot(),
    };

    if json {
        let output =
            serde_json::to_string_pretty(&report).context("Failed to serialize snapshot")?;
        println!("{}", output);
    } else {
        print_snapshot_table(&report);
    }
    Ok(())
}

async fn run_tui_mode(monitor: &NetworkMonitor) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    // Setup terminal
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let mut app = AppState::new(monitor.config().interface.as_deref());

    let res = run_app(&mut terminal, &mut app, monitor, &shutdown).await;

    // Restore terminal
    disable_raw_mode()?;
    execute!(
        terminal.backend_mut(),
        LeaveAlternateScreen,
        DisableMouseCapture
    )?;
    terminal.show_cursor()?;

    res
}

async fn run_app<B: ratatui::backend::Backend>(
    terminal: &mut Terminal<B>,
    app: &mut AppState,
    monitor: &NetworkMonitor,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut update_interval = interval(monitor.config().ui_refresh());
    let mut last_action: Option<Instant> = None;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::info!("Received shutdown signal");
            return Ok(());
        }

        terminal.draw(|f| ui::draw_ui(f, app))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                // If help is shown, any key closes it
                if app.show_help {
                    app.show_help = false;
                    continue;
                }

                match key.code {
                    KeyCode::Char('q') | KeyCode::Esc => {
                        return Ok(());
                    }
                    KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                        return Ok(());
                    }
                    KeyCode::Char('h') | KeyCode::Char('?') => {
                        app.show_help = true;
                    }
                    KeyCode::Down | KeyCode::Char('j') => {
                        app.select_next();
                    }
                    KeyCode::Up | KeyCode::Char('k') => {
                        app.select_previous();
                    }
                    KeyCode::Char('d') => {
                        app.sort_by(SortColumn::Download);
                        last_action = Some(Instant::now());
                    }
                    KeyCode::Char('u') => {
                        app.sort_by(SortColumn::Upload);
                        last_action = Some(Instant::now());
                    }
                    KeyCode::Char('t') => {
                        app.sort_by(SortColumn::Total);
                        last_action = Some(Instant::now());
                    }
                    KeyCode::Char('n') => {
                        app.sort_by(SortColumn::Name);
                        last_action = Some(Instant::now());
                    }
                    KeyCode::Char('c') => {
                        monitor.clear();
                        app.update_processes(monitor.get_snapshot());
                        app.status_message = "Statistics cleared".to_string();
                        last_action = Some(Instant::now());
                    }
                    _ => {}
                }
            }
        }

        // Refresh the table periodically
        if tokio::time::timeout(Duration::from_millis(1), update_interval.tick())
            .await
            .is_ok()
        {
            app.update_processes(monitor.get_snapshot());

            if last_action.is_none_or(|at| at.elapsed() >= STATUS_HOLD) {
                app.status_message = format!(
                    "Monitoring {} process(es), {} connections, {} dropped",
                    app.process_list.len(),
                    monitor.connection_count(),
                    monitor.dropped_packets()
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let config = args.to_config()?;
    check_root()?;

    let monitor = NetworkMonitor::with_default_backends(config)?;
    if let Err(e) = monitor.start_all() {
        log::error!("Failed to start network monitor: {:#}", e);
        return Err(e);
    }

    let res = match args.snapshot {
        Some(seconds) => run_snapshot_mode(&monitor, seconds, args.json).await,
        None => run_tui_mode(&monitor).await,
    };

    monitor.stop_all();
    res
}
