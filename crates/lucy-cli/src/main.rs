//! `lucy-cli` – Lucy operator console
//!
//! Entry point for driving the humanoid over its rosbridge WebSocket.  It:
//!
//! 1. Loads `~/.lucy/config.toml`, writing defaults on first run.
//! 2. Initialises logging (quiet unless `enable_logs` is set) and optional
//!    OTLP export.
//! 3. Builds the process-wide [`BridgeContext`] on a Tokio runtime.
//! 4. Drops the operator into an **interactive REPL** (`/connect`, `/set`,
//!    `/camera`, `/help`, …).
//! 5. Intercepts **Ctrl-C** to close the bridge connection and exit.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

use lucy_bridge::BridgeContext;

fn main() {
    let (cfg, config_note) = match config::load() {
        Ok(Some(cfg)) => (cfg, None),
        Ok(None) => {
            // Write plain defaults; overrides apply to this run only.
            let mut cfg = config::Config::default();
            let saved = config::save(&cfg);
            config::apply_env_overrides(&mut cfg);
            let note = match saved {
                Ok(()) => format!(
                    "{} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => format!("{}: {}", "Error saving config".red(), e),
            };
            (cfg, Some(note))
        }
        Err(e) => {
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            (cfg, Some(format!("{}: {} – using defaults", "Config error".red(), e)))
        }
    };

    let _telemetry = telemetry::init_tracing("lucy", cfg.enable_logs);

    print_banner();
    match config_note {
        Some(note) => println!("  {note}"),
        None => println!(
            "  Config loaded from {}",
            config::config_path().display().to_string().bold()
        ),
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => Arc::new(rt),
        Err(e) => {
            error!(error = %e, "failed to start Tokio runtime");
            println!("{}: {}", "Fatal".red().bold(), e);
            return;
        }
    };

    let ctx = Arc::new(BridgeContext::with_websocket(cfg.bridge.clone()));

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    {
        let shutdown = Arc::clone(&shutdown);
        let manager = ctx.manager().clone();
        if let Err(e) = ctrlc::set_handler(move || {
            println!();
            println!("{}", "⚠  Ctrl-C received – closing the bridge …".yellow().bold());
            manager.disconnect();
            println!("{}", "  ✓ Disconnected from ROS Bridge.".green());
            println!("{}", "  ✓ Exiting Lucy.".green());
            shutdown.store(true, Ordering::SeqCst);
            std::process::exit(0);
        }) {
            warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
        }
    }

    println!(
        "  Bridge URL: {}",
        cfg.preferred_url().dimmed()
    );
    println!();
    println!(
        "  Type {} to reach the robot or {} for a list of commands.\n",
        "/connect".bold().cyan(),
        "/help".bold().cyan()
    );

    repl::run(cfg, ctx, rt, shutdown);
}

fn print_banner() {
    println!();
    println!("{}", r#"   __                "#.bold().cyan());
    println!("{}", r#"  / /  __ ______ __ __"#.bold().cyan());
    println!("{}", r#" / /__/ // / __// // /"#.bold().cyan());
    println!("{}", r#"/____/\_,_/\__/ \_, / "#.bold().cyan());
    println!("{}", r#"               /___/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Lucy".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Humanoid teleoperation console");
    println!();
}
