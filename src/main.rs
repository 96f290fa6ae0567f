use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::backend::{Backend, BackendRegistry};
use turnstile::config::TurnstileConfig;
use turnstile::ratelimit::{Limiter, RateLimit};

/// Exit code reported when the checked caller is over its quota.
const EXIT_EXCEEDED: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "turnstile", version, about = "Fixed-window rate limit checks")]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); TURNSTILE_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Count one operation and print the decision
    Check(RuleArgs),
    /// Fire many concurrent operations at one key and summarize the decisions
    Burst {
        #[command(flatten)]
        rule: RuleArgs,

        /// Number of operations to fire
        #[arg(short = 'n', long, default_value_t = 100)]
        requests: usize,
    },
}

#[derive(Debug, Args)]
struct RuleArgs {
    /// Who is being limited (e.g. a client address)
    #[arg(long)]
    identity: String,

    /// What is being limited (e.g. a route name)
    #[arg(long)]
    scope: String,

    /// Operations allowed per window
    #[arg(long)]
    limit: u64,

    /// Window length in seconds
    #[arg(long, default_value_t = 300)]
    window: u64,
}

impl RuleArgs {
    fn rate_limit(&self) -> anyhow::Result<RateLimit> {
        Ok(RateLimit::new(self.limit, self.window)?)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TurnstileConfig::load(cli.config.as_deref())?;
    let limiter = Arc::new(Limiter::from_config(&config, &BackendRegistry::with_defaults()).await?);
    info!(backend = limiter.backend().name(), key_prefix = %limiter.key_prefix(), "Limiter ready");

    match cli.command {
        Command::Check(args) => check(&limiter, &args).await,
        Command::Burst { rule, requests } => burst(limiter, &rule, requests).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn check(limiter: &Limiter, args: &RuleArgs) -> anyhow::Result<ExitCode> {
    let rule = args.rate_limit()?;
    let info = limiter.decide(&args.identity, &args.scope, &rule).await?;

    println!("{}", serde_json::to_string_pretty(&info)?);

    if info.exceeded {
        Ok(ExitCode::from(EXIT_EXCEEDED))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}

async fn burst(
    limiter: Arc<Limiter>,
    args: &RuleArgs,
    requests: usize,
) -> anyhow::Result<ExitCode> {
    let rule = Arc::new(args.rate_limit()?);
    let mut handles = Vec::with_capacity(requests);

    for _ in 0..requests {
        let limiter = limiter.clone();
        let rule = rule.clone();
        let identity = args.identity.clone();
        let scope = args.scope.clone();
        handles.push(tokio::spawn(async move {
            limiter.decide(&identity, &scope, &rule).await
        }));
    }

    let (mut allowed, mut rejected, mut failed) = (0usize, 0usize, 0usize);
    let mut reset = None;
    for handle in handles {
        match handle.await? {
            Ok(info) => {
                if info.exceeded {
                    rejected += 1;
                } else {
                    allowed += 1;
                }
                reset = reset.max(Some(info.reset));
            }
            Err(err) => {
                warn!(error = %err, "Rate limit check failed");
                failed += 1;
            }
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "requests": requests,
            "allowed": allowed,
            "rejected": rejected,
            "failed": failed,
            "reset": reset,
        }))?
    );

    if failed > 0 {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
