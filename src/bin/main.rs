//! Process entry point: CLI parsing, config resolution, client-pool login,
//! and orchestrator wiring.

use archivist::arbiter::RateArbiter;
use archivist::cli::Cli;
use archivist::MonotonicClock;
use archivist::config::{self, Config, CookiePair};
use archivist::db::Db;
use archivist::orchestrator::Orchestrator;
use archivist::remote::{ClientIdentity, ClientPool};
use archivist::session::Session;
use archivist::AppError;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.dbg);

    let exit_code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "archivist exited with an error");
            e.exit_code()
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing(dbg: bool) {
    let filter = if dbg { "archivist=debug,info" } else { "archivist=info,warn" };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let app_home = config::app_home().map_err(|e| AppError::Config(e.to_string()))?;

    if cli.conf {
        config::run_config_prompt(&app_home, prompt_for_config)
            .map_err(|e| AppError::Config(e.to_string()))?;
        info!("configuration saved, exiting");
        return Ok(());
    }

    let config = config::load(&app_home)
        .map_err(|e| AppError::Config(e.to_string()))?
        .ok_or_else(|| AppError::Config(format!("no configuration found; rerun with --conf ({})", app_home.display())))?;

    let identities = login(&app_home, &config).await?;
    if identities.is_empty() {
        return Err(AppError::Login("no usable client identity could be logged in".to_string()));
    }

    let db_path = config.root_path.join(".data").join("archivist.db");
    let db = Db::connect(&db_path).await?;

    let clock = Arc::new(MonotonicClock::default());
    let arbiter = Arc::new(RateArbiter::new(clock));
    let clients = Arc::new(ClientPool::new(identities, arbiter.clone()));
    let session = Arc::new(Session::new(db, clients, arbiter));

    let orchestrator = Orchestrator::new(session, config.root_path.clone(), cli.auto_follow, cli.no_retry);
    orchestrator.spawn_signal_handler();

    orchestrator.run(&cli).await?;
    Ok(())
}

/// Build one [`ClientIdentity`] per configured cookie (the primary cookie
/// plus any `additional_cookies.yaml` entries), resolving each identity's own
/// handle to label it and to drop cookies that resolve to an already-seen
/// account.
async fn login(app_home: &std::path::Path, config: &Config) -> Result<Vec<Arc<ClientIdentity>>, AppError> {
    let mut cookies = vec![config.cookie.clone()];
    cookies.extend(config::load_additional_cookies(app_home).map_err(|e| AppError::Config(e.to_string()))?);

    let mut resolved = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        match resolve_identity(&cookie).await {
            Ok((identity, handle)) => resolved.push((cookie, identity, handle)),
            Err(e) => {
                error!(error = %e, "dropping a cookie that failed to log in");
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    let mut identities = Vec::with_capacity(resolved.len());
    for (id, (_, mut identity, handle)) in resolved.into_iter().enumerate() {
        if !seen.insert(handle.clone()) {
            continue;
        }
        identity.id = id as u64;
        identity.handle = handle;
        identities.push(Arc::new(identity));
    }
    Ok(identities)
}

async fn resolve_identity(cookie: &CookiePair) -> Result<(ClientIdentity, String), AppError> {
    let identity = ClientIdentity::build(0, String::new(), cookie).map_err(|e| AppError::Login(e.to_string()))?;
    let handle = identity.resolve_handle().await.map_err(|e| AppError::Login(e.to_string()))?;
    Ok((identity, handle))
}

/// The interactive terminal prompt is an external collaborator this crate
/// does not implement; this stub reads the primary cookie pair from
/// environment variables so `--conf` remains usable non-interactively.
fn prompt_for_config() -> Result<Config, archivist::config::ConfigError> {
    use archivist::config::ConfigError;

    let root_path = std::env::var("ARCHIVIST_ROOT_PATH")
        .map(std::path::PathBuf::from)
        .map_err(|_| ConfigError::MissingField { field: "root_path" })?;
    let auth_token =
        std::env::var("ARCHIVIST_AUTH_TOKEN").map_err(|_| ConfigError::MissingField { field: "cookie.auth_token" })?;
    let ct0 = std::env::var("ARCHIVIST_CT0").map_err(|_| ConfigError::MissingField { field: "cookie.ct0" })?;

    Ok(Config { root_path, cookie: CookiePair { auth_token, ct0 }, max_download_routine: None })
}
