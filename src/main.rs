use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ratewarden::clock::{Clock, ManualClock, MonotonicClock};
use ratewarden::config::{LoggingConfig, StoreKind, WardenConfig};
use ratewarden::ratelimit::{RateLimitRules, Warden};
use ratewarden::store::{MemoryKv, StoreBuilder};

#[derive(Debug, Parser)]
#[command(name = "ratewarden", version, about = "Per-identifier admission control")]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to the rate limit rules file (overrides `rules_path`)
    #[arg(short, long, global = true)]
    rules: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Parse and validate the rules, then print which strategy each uses
    CheckRules,

    /// Replay a burst of requests for one identifier on a virtual clock
    Simulate {
        /// Identifier to admit requests for
        identifier: String,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u32,

        /// Virtual time between requests, in milliseconds
        #[arg(short, long, default_value_t = 100)]
        interval_ms: u64,
    },
}

fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .context("invalid log filter")?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
    Ok(())
}

fn load_rules(cli: &Cli, config: &WardenConfig) -> anyhow::Result<RateLimitRules> {
    let path = cli
        .rules
        .clone()
        .or_else(|| config.rules_path.as_ref().map(PathBuf::from))
        .context("no rules file given (use --rules or set rules_path)")?;
    RateLimitRules::from_file(&path)
        .with_context(|| format!("failed to load rules from {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = WardenConfig::load(cli.config.as_deref()).context("failed to load configuration")?;
    init_tracing(&config.logging)?;

    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    let rules = load_rules(&cli, &config)?;

    match cli.command {
        Command::CheckRules => {
            for rule in &rules.rules {
                println!(
                    "{}\t{}\t{}",
                    rule.name,
                    rule.prefix.as_deref().unwrap_or("*"),
                    rule.policy.algorithm_name()
                );
            }
            info!(rules = rules.rules.len(), "Rules are valid");
        }
        Command::Simulate {
            identifier,
            requests,
            interval_ms,
        } => {
            let clock = ManualClock::new(MonotonicClock::new().now());
            let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
            let failure_policy = config.limiter.failure_policy;
            let run = Simulation {
                identifier,
                requests,
                interval: Duration::from_millis(interval_ms),
                sweep_interval: Duration::from_secs(config.limiter.sweep_interval_secs),
                clock,
            };
            match config.limiter.store {
                StoreKind::Local => {
                    let warden = Warden::from_rules(rules, shared_clock, failure_policy)?;
                    run.replay(Arc::new(warden)).await?;
                }
                StoreKind::Shared => {
                    // The in-process backend stands in for a shared one and
                    // keeps time on the virtual clock
                    let backend =
                        MemoryKv::with_clock(Arc::clone(&shared_clock)).with_attached_time();
                    let warden = Warden::shared(
                        rules,
                        Arc::new(backend),
                        config.remote_store.clone(),
                        shared_clock,
                        failure_policy,
                    )?;
                    run.replay(Arc::new(warden)).await?;
                }
            }
        }
    }

    Ok(())
}

struct Simulation {
    identifier: String,
    requests: u32,
    interval: Duration,
    sweep_interval: Duration,
    clock: ManualClock,
}

impl Simulation {
    async fn replay<F: StoreBuilder>(self, warden: Arc<Warden<F>>) -> anyhow::Result<()> {
        let sweeper = (!self.sweep_interval.is_zero())
            .then(|| Warden::spawn_sweeper(Arc::clone(&warden), self.sweep_interval));

        // Admitted concurrency permits stay held for the whole run
        let mut held = Vec::new();
        for request in 1..=self.requests {
            let admission = warden.admit(&self.identifier).await?;
            let verdict = &admission.verdict;
            let line = serde_json::json!({
                "request": request,
                "at": self.clock.now().to_string(),
                "allowed": verdict.allowed,
                "status": verdict.status_code(),
                "remaining": verdict.remaining,
                "reset": verdict.reset_at_epoch_secs(),
                "retry_after": verdict.retry_after_secs(),
            });
            println!("{line}");
            held.extend(admission.permit);
            self.clock.advance(self.interval);
        }

        for permit in held {
            permit.release().await?;
        }
        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        info!(tracked = warden.tracked().await?, "Simulation complete");
        Ok(())
    }
}
