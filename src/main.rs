//! autoland CLI entry point

use anstream::println;
use anyhow::{Context, bail};
use autoland::audit::AuditLog;
use autoland::config::EngineConfig;
use autoland::engine::Engine;
use autoland::platform::GitHubHost;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "autoland", version, about = "Policy-driven PR merge automation")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = "autoland.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the engine, consuming newline-delimited JSON events on stdin
    Run {
        /// Repository as owner/repo
        #[arg(long)]
        repo: String,

        /// GitHub Enterprise host (defaults to github.com)
        #[arg(long)]
        host: Option<String>,
    },

    /// Validate the configuration file (or write a default one)
    CheckConfig {
        /// Write a default configuration to the config path and exit
        #[arg(long)]
        init: bool,
    },

    /// Query the audit log
    Audit {
        /// Only events for this PR number
        #[arg(long)]
        pr: Option<u64>,

        /// Only events at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only events at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run { repo, host } => run(&cli.config, &repo, host).await,
        Command::CheckConfig { init } => check_config(&cli.config, init),
        Command::Audit { pr, since, until } => audit(&cli.config, pr, since, until),
    }
}

async fn run(config_path: &PathBuf, repo: &str, host: Option<String>) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let (owner, name) = repo
        .split_once('/')
        .with_context(|| format!("invalid repo '{repo}', expected owner/repo"))?;
    let token = std::env::var("GITHUB_TOKEN").context("GITHUB_TOKEN is not set")?;

    let github = GitHubHost::new(&token, owner.to_string(), name.to_string(), host)?;
    let engine = Arc::new(Engine::new(config, Arc::new(github))?);
    engine.recover().await?;
    let workers = engine.spawn_workers();

    info!(repo, "engine running; reading events from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let raw: serde_json::Value = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "dropping unparseable event line");
                continue;
            }
        };
        // One bad event never stops the engine
        if let Err(e) = engine.handle_event(&raw).await {
            warn!(error = %e, "event handling failed");
        }
    }

    info!("input closed; draining merge queue");
    while engine.queue().in_flight_count() > 0 || engine.queue().waiting_len() > 0 {
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    for worker in workers {
        worker.abort();
    }
    Ok(())
}

fn check_config(config_path: &PathBuf, init: bool) -> anyhow::Result<()> {
    if init {
        if config_path.exists() {
            bail!("{} already exists", config_path.display());
        }
        EngineConfig::default().save(config_path)?;
        println!(
            "{} wrote default configuration to {}",
            "✓".green(),
            config_path.display()
        );
        return Ok(());
    }

    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let policy = config.policy_set()?;

    println!("{} configuration is valid", "✓".green());
    println!();
    println!("{}", "Tiers (in priority order):".bold());
    for tier in policy.tiers() {
        let soak = if tier.soak_secs == 0 {
            "no soak".to_string()
        } else {
            format!("soak {}s", tier.soak_secs)
        };
        println!(
            "  {} {} ({}, {} approval(s), {} via {})",
            tier.priority.dimmed(),
            tier.id.cyan(),
            soak,
            tier.required_approvals,
            if tier.required_checks.is_empty() {
                "no required checks".to_string()
            } else {
                tier.required_checks.join(", ")
            },
            tier.merge_method,
        );
    }
    if !policy.global_blocking().is_empty() {
        println!();
        println!(
            "{} {}",
            "Global blocking labels:".bold(),
            policy
                .global_blocking()
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
                .red()
        );
    }
    Ok(())
}

fn audit(
    config_path: &PathBuf,
    pr: Option<u64>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let log = AuditLog::open(&config.audit_path())?;

    let events = log.query(pr, since, until)?;
    if events.is_empty() {
        println!("{}", "No audit events match.".dimmed());
        return Ok(());
    }

    for event in &events {
        println!(
            "{} {} {} {} {} ({}) {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S").dimmed(),
            format!("#{}", event.pr_id).cyan(),
            event.from,
            "→".dimmed(),
            event.to.bold(),
            event.actor,
            event.reason,
        );
    }
    println!();
    println!("{} event(s)", events.len());
    Ok(())
}
