//! CivicGuard - content security and tenant isolation for municipal
//! training platforms
//!
//! Runs the security gateway HTTP API and the operator tooling around it:
//! session tokens, one-off sanitization and the CI baseline gate.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use civicguard::{
    api::build_app,
    audit::TenantAuditFiles,
    baseline::{
        evaluate_corpus, isolation_counts, load_corpus, load_snapshots, BaselineDocument,
        BaselineStore, BaselineTracker,
    },
    config::CivicGuardConfig,
    gateway::SecurityGateway,
    patterns::{ContentType, PatternLibrary},
    sanitize::{ContentPayload, SanitizationEngine},
    tenant::{SessionManager, TenantId},
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "civicguard")]
#[command(author = "CivicGuard Team")]
#[command(version)]
#[command(about = "Content security and tenant isolation for municipal training platforms")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CIVICGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the security gateway HTTP API
    Serve {
        /// Host to bind to, overrides the configuration
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on, overrides the configuration
        #[arg(long)]
        port: Option<u16>,
    },

    /// Mint a session token for a configured tenant
    Token {
        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,
    },

    /// Sanitize content read from stdin and print the result
    Sanitize {
        /// quiz-text, document, announcement, dialogue or feedback
        #[arg(long)]
        content_type: String,

        #[arg(long, default_value = "cli")]
        tenant: String,
    },

    /// Security baseline gate
    Baseline {
        #[command(subcommand)]
        command: BaselineCommands,
    },

    /// Show configuration
    Config {
        /// Show default configuration
        #[arg(long)]
        default: bool,
    },
}

#[derive(Subcommand)]
enum BaselineCommands {
    /// Compare metrics snapshots against the latest accepted baseline
    Check {
        /// JSON file holding an array of metrics snapshots
        #[arg(long)]
        metrics: PathBuf,

        /// Count isolation incidents from the audit trails into the
        /// isolation snapshot
        #[arg(long)]
        with_audit: bool,

        /// Audit directory, overrides the configuration
        #[arg(long, requires = "with_audit")]
        audit_dir: Option<PathBuf>,

        /// Start of the audit window (RFC 3339), default 24 hours ago
        #[arg(long, requires = "with_audit")]
        since: Option<DateTime<Utc>>,
    },

    /// Run the sanitizer over a labelled JSONL corpus
    Evaluate {
        #[arg(long)]
        corpus: PathBuf,
    },

    /// Accept a baseline document as the next version
    Accept {
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout is reserved for command output
    let json = cli.log_format == LogFormat::Json;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "civicguard=info,tower_http=info".into()),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    let config = load_config(cli.config)?;

    match cli.command {
        Commands::Serve { host, port } => {
            run_server(config, host, port).await?;
        }
        Commands::Token { tenant, user } => {
            mint_token(&config, &tenant, &user)?;
        }
        Commands::Sanitize {
            content_type,
            tenant,
        } => {
            sanitize_stdin(&config, &content_type, &tenant).await?;
        }
        Commands::Baseline { command } => {
            run_baseline(&config, command).await?;
        }
        Commands::Config { default } => {
            show_config(if default { None } else { Some(&config) })?;
        }
    }

    Ok(())
}

/// Explicit path, then the user config directory, then defaults
fn load_config(path: Option<PathBuf>) -> Result<CivicGuardConfig> {
    if let Some(path) = path {
        return CivicGuardConfig::load(&path)
            .with_context(|| format!("loading {}", path.display()));
    }
    let default_path = dirs_next::config_dir().map(|p| p.join("civicguard").join("config.toml"));
    match default_path {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "Using user configuration");
            CivicGuardConfig::load(&path).with_context(|| format!("loading {}", path.display()))
        }
        _ => Ok(CivicGuardConfig::default()),
    }
}

async fn run_server(
    mut config: CivicGuardConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let cors_origins = config.server.cors_origins.clone();

    let gateway = Arc::new(SecurityGateway::new(config).await?);
    gateway.start().await?;

    let app = build_app(gateway.clone(), &cors_origins);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    tracing::info!(addr = %addr, "CivicGuard is running. Press Ctrl+C to stop.");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await?;

    tracing::info!("Shutting down...");
    gateway.stop().await?;
    Ok(())
}

fn mint_token(config: &CivicGuardConfig, tenant: &str, user: &str) -> Result<()> {
    if std::env::var(&config.session.secret_env).is_err() {
        bail!(
            "{} is not set; a token signed with an ephemeral secret would never verify",
            config.session.secret_env
        );
    }
    let tenant_id = TenantId::new(tenant)?;
    if !config.tenants.iter().any(|t| t.id == tenant_id) {
        bail!("tenant {} is not configured", tenant_id);
    }
    let sessions = SessionManager::from_config(&config.session)?;
    let issued = sessions.issue(&tenant_id, user);
    println!("{}", serde_json::to_string_pretty(&issued)?);
    Ok(())
}

fn build_engine(config: &CivicGuardConfig) -> Result<SanitizationEngine> {
    let library = Arc::new(PatternLibrary::with_extensions(&config.sanitizer.patterns)?);
    Ok(SanitizationEngine::new(library, &config.sanitizer)?)
}

async fn sanitize_stdin(config: &CivicGuardConfig, content_type: &str, tenant: &str) -> Result<()> {
    let content_type: ContentType = content_type.parse()?;
    let tenant_id = TenantId::new(tenant)?;

    let mut raw = String::new();
    tokio::io::stdin()
        .read_to_string(&mut raw)
        .await
        .context("reading stdin")?;

    let engine = build_engine(config)?;
    let result = engine.sanitize(&ContentPayload::new(raw, content_type, tenant_id))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_baseline(config: &CivicGuardConfig, command: BaselineCommands) -> Result<()> {
    let store = BaselineStore::new(config.baseline.dir.clone());
    match command {
        BaselineCommands::Check {
            metrics,
            with_audit,
            audit_dir,
            since,
        } => {
            let mut snapshots = load_snapshots(&metrics)?;
            if with_audit {
                let dir = audit_dir.unwrap_or_else(|| config.audit.dir.clone());
                let end = Utc::now();
                let start = since.unwrap_or(end - chrono::Duration::hours(24));
                let files = TenantAuditFiles::new(&dir).await?;
                isolation_counts(&files, start, end)
                    .await?
                    .apply(&mut snapshots, start, end);
            }
            let report = BaselineTracker::new(store).check(&snapshots)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.regressed {
                bail!(
                    "security baseline v{} regressed in {} metric(s)",
                    report.baseline_version,
                    report.regressions.len()
                );
            }
        }
        BaselineCommands::Evaluate { corpus } => {
            let samples = load_corpus(&corpus)?;
            let snapshots = evaluate_corpus(&build_engine(config)?, &samples)?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
        }
        BaselineCommands::Accept { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let doc = store.accept(BaselineDocument::parse(&text)?)?;
            println!(
                "Accepted security baseline v{} ({} domains) in {}",
                doc.version,
                doc.baselines.len(),
                store.dir().display()
            );
        }
    }
    Ok(())
}

fn show_config(config: Option<&CivicGuardConfig>) -> Result<()> {
    let toml = match config {
        Some(config) => toml::to_string_pretty(config)?,
        None => CivicGuardConfig::default_toml()?,
    };
    println!("{}", toml);
    Ok(())
}
