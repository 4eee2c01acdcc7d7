//! upstox-auth - Multi-account OAuth2 token manager for the Upstox API
//!
//! Obtains access tokens for several API credentials sharing one redirect
//! endpoint and maintains them in a single persisted token table with an
//! exchange-session expiry rule.

mod api;
mod auth;
mod config;
mod driver;
mod store;

use std::process::ExitCode;

use anyhow::Result;
use chrono::Local;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::{AuthEndpoints, BatchRunner, CredentialRegistry, Orchestrator, StdinPrompt};
use config::Settings;
use driver::WebDriverLogin;
use store::TokenStore;

#[derive(Parser)]
#[command(name = "upstox-auth")]
#[command(about = "Multi-account OAuth2 token manager for the Upstox API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquire access tokens for every configured API credential
    Login {
        /// Skip the automated browser login and paste redirect URLs manually
        #[arg(long)]
        manual: bool,

        /// Also download the instruments master after token generation
        #[arg(long)]
        contracts: bool,

        /// Skip profile verification of freshly acquired tokens
        #[arg(long)]
        no_profile: bool,
    },

    /// Show validity information for stored tokens
    Status,

    /// Print one stored access token, for scripting
    Token {
        /// Credential name, e.g. MARKETDATA1
        name: String,

        /// Print the token even if it has lapsed
        #[arg(long)]
        ignore_validity: bool,
    },

    /// Remove expired or orphaned tokens from the store
    Cleanup,

    /// Download the gzipped instruments master
    Contracts {
        /// Show information about the local file instead of downloading
        #[arg(long)]
        info: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Environment first: credentials and paths come from .env if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Login {
            manual,
            contracts,
            no_profile,
        } => {
            tracing::info!("Starting multi-account authorization...");
            return login(&settings, manual, contracts, no_profile).await;
        }
        Commands::Status => status(&settings),
        Commands::Token {
            name,
            ignore_validity,
        } => token(&settings, &name, ignore_validity),
        Commands::Cleanup => cleanup(&settings),
        Commands::Contracts { info } => {
            if info {
                api::contracts::print_info(&settings.contracts);
                Ok(())
            } else {
                api::contracts::download(&settings.contracts).await.map(|_| ())
            }
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// The batch login command. Exit code: 0 all credentials succeeded,
/// 2 partial, 1 none, 130 interrupted.
async fn login(
    settings: &Settings,
    manual: bool,
    with_contracts: bool,
    no_profile: bool,
) -> ExitCode {
    let store = TokenStore::new(settings.tokens_path.clone());

    // Drop expired and orphaned tokens before acquiring new ones.
    match store.cleanup(&settings.slot_names(), Local::now().naive_local()) {
        Ok(removed) if !removed.is_empty() => {
            let names: Vec<String> = removed
                .iter()
                .map(|r| format!("{} ({})", r.name, r.reason))
                .collect();
            println!("Cleaned up stored tokens: {}", names.join(", "));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("token cleanup failed: {}", e),
    }

    let registry = CredentialRegistry::from_settings(settings);
    let credentials = match registry.validate() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    println!("Processing {} API credential(s)...", credentials.len());

    let orchestrator = match Orchestrator::new(
        AuthEndpoints::default(),
        settings.login.clone(),
        WebDriverLogin::new(settings.webdriver_url.clone()),
        StdinPrompt,
        !manual,
    ) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            tracing::error!("{:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let runner = BatchRunner::new(orchestrator, &store, auth::batch::INTER_CREDENTIAL_DELAY);
    let summary = runner.run(&credentials).await;

    summary.print();

    if !summary.issued.is_empty() {
        store::print_validity_report(&store, Local::now().naive_local());

        if !no_profile && !summary.interrupted {
            let tokens: Vec<(String, String)> = summary
                .issued
                .iter()
                .map(|(name, record)| (name.clone(), record.access_token.clone()))
                .collect();
            api::profile::verify_profiles(&tokens).await;
        }
    }

    if with_contracts && !summary.interrupted {
        if let Err(e) = api::contracts::download(&settings.contracts).await {
            tracing::error!("contracts download failed: {:#}", e);
        }
    }

    ExitCode::from(summary.outcome().exit_code())
}

/// Show per-token validity for everything in the store.
fn status(settings: &Settings) -> Result<()> {
    let store = TokenStore::new(settings.tokens_path.clone());
    let now = Local::now().naive_local();
    store::print_validity_report(&store, now);

    let ready = store.all_active(true, now);
    let lapsed = store.expired(now);
    if !ready.is_empty() {
        println!("{} token(s) ready for use.", ready.len());
    }
    if !lapsed.is_empty() {
        println!(
            "{} token(s) need regeneration; run 'upstox-auth login'.",
            lapsed.len()
        );
    }
    Ok(())
}

/// Print a single access token for shell consumption.
fn token(settings: &Settings, name: &str, ignore_validity: bool) -> Result<()> {
    let store = TokenStore::new(settings.tokens_path.clone());
    match store.get_token(name, !ignore_validity, Local::now().naive_local()) {
        Some(access_token) => {
            println!("{}", access_token);
            Ok(())
        }
        None => anyhow::bail!("No usable token for {}", name),
    }
}

/// Standalone cleanup of the token store.
fn cleanup(settings: &Settings) -> Result<()> {
    let store = TokenStore::new(settings.tokens_path.clone());
    let removed = store.cleanup(&settings.slot_names(), Local::now().naive_local())?;
    if removed.is_empty() {
        println!("Nothing to clean up.");
    } else {
        for r in &removed {
            println!("Removed {} ({})", r.name, r.reason);
        }
    }
    Ok(())
}
