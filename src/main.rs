mod account;
mod api;
mod cli;
mod config;
mod credentials;
mod error;
mod forms;
mod guard;
mod idle;
mod session;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing_subscriber::{fmt, EnvFilter};

use session::store::{CookieJarStore, CredentialStore, FileStore, MemoryStore};

#[derive(Parser)]
#[command(name = "citypass", about = "Terminal client for the municipal services portal")]
pub struct Args {
    #[arg(long, env = "CITYPASS_API_URL", help = "REST API base URL")]
    pub base_url: Option<String>,

    #[arg(long, help = "Config file path")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "MS",
        help = "Sign out after this much inactivity (0 disables)"
    )]
    pub idle_timeout_ms: Option<u64>,

    #[arg(
        long,
        value_name = "POLICY",
        help = "Long-lived credential storage: cookie, file, memory"
    )]
    pub persistence: Option<String>,

    #[arg(long, help = "Credentials file for --persistence file")]
    pub credentials_file: Option<PathBuf>,

    #[arg(short, long, help = "Run one command (e.g. \"/whoami\") and exit")]
    pub command: Option<String>,

    #[arg(long, help = "Debug output (HTTP flow and session transitions)")]
    pub debug: bool,
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(args.debug);

    let mut cfg = if let Some(config_path) = &args.config {
        config::Config::load_from(config_path)?
    } else {
        config::Config::load()?
    };

    // CLI and environment take priority over files
    if let Some(base_url) = &args.base_url {
        cfg.api.base_url = Some(base_url.clone());
    }
    if let Some(ms) = args.idle_timeout_ms {
        cfg.session.idle_timeout_ms = Some(ms);
    }
    if let Some(policy) = &args.persistence {
        match config::PersistencePolicy::from_str(policy) {
            Some(policy) => cfg.session.persistence = Some(policy),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid persistence policy: {}. Use: cookie, file, memory",
                    policy
                ))
            }
        }
    }
    if let Some(path) = &args.credentials_file {
        cfg.session.credentials_file = Some(path.clone());
    }

    if let Err(errors) = cfg.validate() {
        let listed: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        return Err(anyhow::anyhow!("Invalid configuration:\n  {}", listed.join("\n  ")));
    }

    tracing::debug!(
        base_url = cfg.base_url(),
        persistence = cfg.persistence().as_str(),
        idle_timeout_ms = cfg.idle_timeout_ms(),
        "starting"
    );

    let auth_header = api::AuthHeader::new();
    let (api, store): (Arc<api::ApiClient>, Arc<dyn CredentialStore>) = match cfg.persistence() {
        config::PersistencePolicy::Cookie => {
            let path = CookieJarStore::default_path();
            let jar = CookieJarStore::read_jar(&path).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring unreadable cookie jar");
                Default::default()
            });
            let api = Arc::new(api::ApiClient::with_cookies(
                cfg.base_url(),
                cfg.timeout_ms(),
                auth_header.clone(),
                jar,
            ));
            let store: Arc<dyn CredentialStore> =
                Arc::new(CookieJarStore::new(api.clone(), &path));
            (api, store)
        }
        config::PersistencePolicy::File => {
            let path = cfg
                .session
                .credentials_file
                .clone()
                .unwrap_or_else(FileStore::default_path);
            let api = Arc::new(api::ApiClient::new(
                cfg.base_url(),
                cfg.timeout_ms(),
                auth_header.clone(),
            ));
            let store: Arc<dyn CredentialStore> = Arc::new(FileStore::new(&path));
            (api, store)
        }
        config::PersistencePolicy::Memory => {
            let api = Arc::new(api::ApiClient::new(
                cfg.base_url(),
                cfg.timeout_ms(),
                auth_header.clone(),
            ));
            let store: Arc<dyn CredentialStore> = Arc::new(MemoryStore::new());
            (api, store)
        }
    };
    let service = Arc::new(credentials::HttpCredentialService::new(api.clone()));
    let session = Arc::new(session::SessionManager::new(service, store, auth_header));

    // Must finish before any route decision is trusted
    session.restore();

    let location = Arc::new(Mutex::new(guard::HOME_PATH.to_string()));
    let idle = match cfg.idle_timeout_ms() {
        0 => None,
        ms => Some(idle::IdleMonitor::spawn(
            Duration::from_millis(ms),
            session.clone(),
            Arc::new(cli::TerminalNotice::new(location.clone())),
        )),
    };

    let ctx = cli::Context {
        routes: guard::RouteTable::builtin().with_overrides(&cfg.routes),
        account: account::AccountService::new(api),
        session,
        idle,
        location,
        args,
    };

    if let Some(command) = ctx.args.command.clone() {
        cli::run_once(&ctx, &command)
    } else {
        cli::run_repl(ctx)
    }
}
