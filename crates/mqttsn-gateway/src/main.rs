// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! MQTT-SN aggregating gateway CLI
//!
//! # Usage
//!
//! ```bash
//! # Defaults: UDP 0.0.0.0:1884, broker localhost:1883
//! mqttsn-gateway
//!
//! # Using configuration file, with overrides
//! mqttsn-gateway --config gateway.toml --broker-host broker.local
//!
//! # Write an example configuration
//! mqttsn-gateway gen-config --output gateway.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use mqttsn_gateway::{
    ConfigError, Gateway, GatewayConfig, GatewayStats, GatewayStatsSnapshot, MqttUpstream,
    TracingObserver, UdpTransport,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// MQTT-SN aggregating gateway
#[derive(Parser, Debug)]
#[command(name = "mqttsn-gateway")]
#[command(about = "Aggregating MQTT-SN gateway - bridges UDP sensor clients to an MQTT broker")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// MQTT-SN UDP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind the UDP socket to
    #[arg(long)]
    bind: Option<String>,

    /// Broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// Broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// MQTT client id used towards the broker
    #[arg(long)]
    client_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Statistics reporting interval (seconds, 0 to disable)
    #[arg(long)]
    stats_interval: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "gateway.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate {
        /// Configuration file path
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if let Some(cmd) = args.command {
        return match cmd {
            Commands::GenConfig { output } => cmd_gen_config(output),
            Commands::Validate { config } => cmd_validate(config),
        };
    }

    let config = build_config(&args)?;

    // Initialize logging
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("MQTT-SN gateway {} v{}", config.name, env!("CARGO_PKG_VERSION"));

    let (upstream, broker_events) = MqttUpstream::connect(&config.broker).await?;
    let transport = UdpTransport::bind(config.listen_addr()?).await?;
    info!("Listening for MQTT-SN clients on udp://{}", transport.local_addr()?);

    let stats = Arc::new(GatewayStats::new());
    let gateway = Gateway::new(
        config.clone(),
        Arc::new(transport),
        Arc::new(upstream),
        Arc::new(TracingObserver::new(Arc::clone(&stats))),
    );
    let runner = tokio::spawn(Arc::clone(&gateway).run(broker_events));

    // Stats reporting task
    if config.stats_interval_secs > 0 {
        let stats = Arc::clone(&stats);
        let period = Duration::from_secs(config.stats_interval_secs);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // First tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                print_stats(&stats.snapshot());
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");
    gateway.shutdown();
    runner.await?;

    println!("\nFinal Statistics:");
    print_stats(&stats.snapshot());
    Ok(())
}

/// Config file (or defaults) with command-line overrides applied.
fn build_config(args: &Args) -> Result<GatewayConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => GatewayConfig::from_file(path)?,
        None => GatewayConfig::default(),
    };

    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(bind) = &args.bind {
        config.bind_address = bind.clone();
    }
    if let Some(host) = &args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if let Some(client_id) = &args.client_id {
        config.broker.client_id = client_id.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval_secs = interval;
    }

    config.validate()?;
    Ok(config)
}

fn cmd_gen_config(output: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = GatewayConfig {
        name: "example-gateway".into(),
        ..Default::default()
    };
    config.broker.host = "broker.example.com".into();
    config.broker.client_id = "example-gateway".into();

    let content = format!(
        r#"# MQTT-SN Gateway Configuration
# Generated by mqttsn-gateway gen-config

{}
"#,
        config.to_toml()?
    );

    std::fs::write(&output, content)?;
    println!("Generated configuration file: {}", output.display());
    Ok(())
}

fn cmd_validate(config_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    match GatewayConfig::from_file(&config_path) {
        Ok(config) => {
            println!("Configuration valid!");
            println!();
            println!("Gateway: {}", config.name);
            println!("Listen:  udp://{}:{}", config.bind_address, config.port);
            println!(
                "Broker:  {}:{} as {} (QoS {})",
                config.broker.host, config.broker.port, config.broker.client_id, config.broker.qos
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration invalid: {}", e);
            std::process::exit(1);
        }
    }
}

fn print_stats(stats: &GatewayStatsSnapshot) {
    println!("--- Gateway Statistics ---");
    println!(
        "  Clients: {} active | In: {} msgs ({:.1} msg/s), {} | Out: {} msgs, {}",
        stats.active_sessions,
        stats.datagrams_received,
        stats.datagrams_per_second(),
        format_bytes(stats.bytes_received),
        stats.datagrams_sent,
        format_bytes(stats.bytes_sent),
    );
    println!(
        "  Broker: {} forwarded, {} distributed, {} deferred | {} decode errors, {} handler errors, {} delivery failures, {} expired",
        stats.forwarded,
        stats.distributed,
        stats.deferred,
        stats.decode_errors,
        stats.handler_errors,
        stats.delivery_failures,
        stats.pending_expired,
    );
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
