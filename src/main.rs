use std::env;
use std::path::Path;

use anyhow::Result;
use tracing::{error, info};

use relay_rtc::config::Config;
use relay_rtc::peer::Str0mFactory;
use relay_rtc::util::init_log;
use relay_rtc::{server, SignalingClient};

const DEFAULT_RELAY_ADDR: &str = "0.0.0.0:7860";

#[tokio::main]
async fn main() {
    init_log();

    let args: Vec<String> = env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        Some("relay") => {
            let addr = args.get(2).map(String::as_str).unwrap_or(DEFAULT_RELAY_ADDR);
            println!("Starting relay on {addr}...");
            server::run(addr).await
        }
        Some("client") => {
            println!("Starting signaling client...");
            run_client(args.get(2).map(Path::new)).await
        }
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run_client(config_path: Option<&Path>) -> Result<()> {
    let config = match config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    }
    .with_env_overrides();
    config.validate()?;

    let mut client = SignalingClient::new(config, Str0mFactory::new());
    let handle = client.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, stopping");
            handle.stop();
        }
    });

    client.start().await?;
    let outcome = client.run().await;
    client.stop().await;

    match outcome.reason {
        Some(reason) => println!("Session {}: {}", outcome.state, reason),
        None => println!("Session {}", outcome.state),
    }
    Ok(())
}

fn print_usage() {
    println!("Relay RTC");
    println!("Usage:");
    println!("  relay-rtc relay [addr]     - Start the signaling relay, default {DEFAULT_RELAY_ADDR}");
    println!("  relay-rtc client [config]  - Start the signaling client");
}
