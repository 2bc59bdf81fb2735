//! SSR local tunnel binary
//!
//! Usage: ssr-local [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>  Path to configuration file
//!   -t, --check <FILE>   Validate a configuration file and exit
//!   -h, --help           Print help information

use std::env;
use std::sync::Arc;

use ssr_engine::local::LocalServer;
use ssr_engine::perf::PerformanceMonitor;
use ssr_engine::protocol::NoopObserver;
use ssr_engine::SsrConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_target(false)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage();
        return Ok(());
    }

    match args[1].as_str() {
        "-h" | "--help" => {
            print_usage();
        }
        "-t" | "--check" => {
            if args.len() < 3 {
                eprintln!("Error: --check requires a config file path");
                return Ok(());
            }
            let config = load_config(&args[2])?;
            tracing::info!(
                "configuration ok: {} via {} ({} / {})",
                config.remarks,
                config.endpoint(),
                config.method,
                config.obfs
            );
        }
        "-c" | "--config" => {
            if args.len() < 3 {
                eprintln!("Error: --config requires a file path");
                return Ok(());
            }
            run_tunnel(&args[2]).await?;
        }
        _ => {
            eprintln!("Unknown option: {}", args[1]);
            print_usage();
        }
    }

    Ok(())
}

fn print_usage() {
    println!(
        r#"ssr-local - SSR tunneling engine

USAGE:
    ssr-local [OPTIONS]

OPTIONS:
    -c, --config <FILE>  Run the tunnel described by a config file
    -t, --check <FILE>   Validate a config file and exit
    -h, --help           Print help information

CONFIGURATION FILE FORMAT (JSON):
    {{
        "server_address": "ssr.example.com",
        "server_port": 8388,
        "local_port": 1080,
        "password": "<shared secret>",
        "method": "aes-256-cfb",
        "protocol": "origin",
        "obfs": "http_simple",
        "obfs_param": "cdn.example.org",
        "remarks": "my node"
    }}

EXAMPLES:
    Validate a config:
        ssr-local --check node.json

    Run the tunnel:
        ssr-local --config node.json
"#
    );
}

async fn run_tunnel(config_path: &str) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    tracing::info!(
        "tunneling 127.0.0.1:{} through {} ({} / {})",
        config.local_port,
        config.endpoint(),
        config.method,
        config.obfs
    );

    let probe_target = Some((config.server_address.clone(), config.server_port));
    let server = Arc::new(LocalServer::new(config, Arc::new(NoopObserver))?);

    // Background governors: memory pressure checks and perf sampling
    server.services().memory.start();
    let monitor = PerformanceMonitor::new(probe_target);
    monitor.start();

    let runner = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received, shutting down");

    server.shutdown();
    server.services().memory.shutdown();
    if let Some(report) = monitor.stop() {
        println!("{}", report.format());
    }
    println!("{}", server.metrics().format_report());

    runner.await??;
    Ok(())
}

fn load_config(path: &str) -> anyhow::Result<SsrConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: SsrConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}
