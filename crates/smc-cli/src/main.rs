use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use smc_auth::{complete_consent, OAuthTokenEndpoint, RefreshTokenStore};
use smc_fetch::JsonHttpClient;
use smc_storage::{PgConfig, PgGateway};
use smc_sync::{
    check_services, maybe_build_scheduler, run_services, EnvAdapterFactory, RunRequest,
    ServiceRegistry, SyncConfig,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "smc")]
#[command(about = "Search metrics collector")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Collect data for the given services, or every enabled one.
    Run(RunArgs),
    /// Probe storage and each service's API without collecting.
    Check {
        services: Vec<String>,
    },
    /// Print the Google consent URL, or exchange the code it redirected with for a refresh token.
    Authorize {
        /// `code` query parameter from the redirect after consent.
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        force: bool,
    },
    /// Persist a refresh token obtained elsewhere.
    StoreToken {
        token: String,
        #[arg(long)]
        force: bool,
    },
    /// Run every enabled service on the configured cron until Ctrl-C.
    Schedule,
}

#[derive(Debug, Default, Args)]
struct RunArgs {
    services: Vec<String>,
    #[arg(long)]
    start_date: Option<NaiveDate>,
    #[arg(long)]
    end_date: Option<NaiveDate>,
    /// Overwrite rows that already exist.
    #[arg(long)]
    force: bool,
    #[arg(long)]
    manual: bool,
}

impl RunArgs {
    /// Flags win over the MANUAL_* / FORCE_OVERRIDE environment.
    fn request(&self) -> Result<RunRequest> {
        let env = RunRequest::from_env()?;
        Ok(RunRequest {
            manual_mode: self.manual || env.manual_mode,
            start_date: self.start_date.or(env.start_date),
            end_date: self.end_date.or(env.end_date),
            force_override: self.force || env.force_override,
        })
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,smc_sync=debug,smc_adapters=debug")),
        )
        .init();
}

async fn ensure_replaceable(store: &RefreshTokenStore, force: bool) -> Result<()> {
    if store.exists().await && !force {
        bail!(
            "{} already holds a refresh token; pass --force to replace it",
            store.path().display()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            let request = args.request()?;
            let report = run_services(&config, &args.services, &request).await?;
            println!("{}", report.summary());
            if !report.all_succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Check { services } => {
            let registry = ServiceRegistry::load(&config.registry_path()).await?;
            let selected = registry.select(&services)?;
            let gateway = PgGateway::new(PgConfig::from_env().context("database configuration")?);
            let http = JsonHttpClient::new(config.http_config())?;
            let factory = EnvAdapterFactory::new(config.clone(), http);
            let checks = check_services(&gateway, &factory, &selected).await;
            let mut healthy = true;
            for check in &checks {
                match &check.result {
                    Ok(()) => println!("ok      {}", check.name),
                    Err(err) => {
                        healthy = false;
                        println!("failed  {}: {err}", check.name);
                    }
                }
            }
            if !healthy {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Authorize { code, force } => {
            let google = &config.google;
            let store = RefreshTokenStore::new(&google.refresh_token_path);
            ensure_replaceable(&store, force).await?;
            let http = JsonHttpClient::new(config.http_config())?;
            let endpoint = OAuthTokenEndpoint::new(
                http.client().clone(),
                google.oauth_client().context("google oauth client")?,
            );
            match code {
                None => {
                    let url = endpoint.consent_url(&google.auth_url, &google.redirect_uri, &google.scopes)?;
                    println!("Open this URL, approve access, then rerun with the `code` from the redirect:");
                    println!();
                    println!("  {url}");
                    println!();
                    println!("  smc authorize --code <code>");
                }
                Some(code) => {
                    let record = complete_consent(&endpoint, &store, &code, &google.redirect_uri).await?;
                    println!(
                        "refresh token stored at {} ({})",
                        store.path().display(),
                        record.created_at.to_rfc3339()
                    );
                }
            }
        }
        Commands::StoreToken { token, force } => {
            let token = token.trim();
            if token.is_empty() {
                bail!("refresh token is empty");
            }
            let store = RefreshTokenStore::new(&config.google.refresh_token_path);
            ensure_replaceable(&store, force).await?;
            let record = store.save(token).await?;
            println!(
                "refresh token stored at {} ({})",
                store.path().display(),
                record.created_at.to_rfc3339()
            );
        }
        Commands::Schedule => {
            let Some(mut sched) = maybe_build_scheduler(&config).await? else {
                bail!("scheduler disabled; set SMC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            tracing::info!(cron = %config.sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(ExitCode::SUCCESS)
}
