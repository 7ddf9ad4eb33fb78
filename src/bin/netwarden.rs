use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use netwarden::config::Config;
use netwarden::detect::{ConnectionInfo, DetectionEngine};
use netwarden::heuristics::{analyze_domain, shannon_entropy};
use netwarden::intel::{IocMatcher, ListStore, ReputationService, StaticProvider};

#[derive(Parser)]
#[command(name = "netwarden")]
#[command(author, version, about = "Device-local network threat inspection")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Score an IP address against the indicator feed and port heuristics
    CheckIp {
        /// IP address to check
        ip: IpAddr,

        /// Destination port to evaluate
        #[arg(short, long, default_value = "443")]
        port: u16,

        /// Indicator feed file, one IP or CIDR per line
        #[arg(short, long)]
        feed: Option<PathBuf>,
    },

    /// Run DGA analysis on a domain name
    CheckDomain {
        /// Domain to analyze
        domain: String,
    },

    /// Print the Shannon entropy of a string
    Entropy {
        /// Text to measure
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = match cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        Commands::CheckIp { ip, port, feed } => check_ip(&config, ip, port, feed).await,
        Commands::CheckDomain { domain } => {
            check_domain(&domain);
            Ok(())
        }
        Commands::Entropy { text } => {
            println!("{:.4}", shannon_entropy(&text));
            Ok(())
        }
    }
}

async fn check_ip(config: &Config, ip: IpAddr, port: u16, feed: Option<PathBuf>) -> Result<()> {
    let ioc = Arc::new(IocMatcher::with_bloom_params(
        config.intel.bloom_expected_elements,
        config.intel.bloom_fp_rate,
    ));
    if let Some(path) = feed.or_else(|| config.intel.feed_path.clone().map(PathBuf::from)) {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read feed file: {}", path.display()))?;
        ioc.replace_feed(content.lines());
        println!("Loaded {} indicators", ioc.indicator_count());
    }

    let reputation = Arc::new(ReputationService::new(
        Arc::new(StaticProvider::empty()),
        Duration::from_secs(config.intel.reputation_ttl_secs),
        Duration::from_secs(config.intel.reputation_timeout_secs),
    ));
    let engine = DetectionEngine::new(
        config.detection.clone(),
        ioc,
        Arc::new(ListStore::new()),
        reputation,
    );

    let analysis = engine
        .analyze_connection(&ConnectionInfo {
            dst_ip: ip,
            dst_port: port,
            protocol: 6,
            domain: None,
        })
        .await;

    println!("{}:{}", ip, port);
    println!("  level:  {}", analysis.level);
    println!("  score:  {}/100", analysis.score);
    println!("  reason: {}", analysis.reason);
    println!("  block:  {}", analysis.should_block);
    Ok(())
}

fn check_domain(domain: &str) {
    let analysis = analyze_domain(domain);
    println!("{}", domain);
    println!("  dga:        {}", analysis.is_dga);
    println!("  confidence: {:.2}", analysis.confidence);
    println!("  entropy:    {:.2}", analysis.entropy);
    println!("  reason:     {}", analysis.reason);
}
