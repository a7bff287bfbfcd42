//! sessionkeeper - sign in to an API from the terminal and keep the session
//! in the cache directory or the OS keychain.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use sessionkeeper_core::api::RegisterRequest;
use sessionkeeper_core::storage::{FileStorage, KeyringStorage, MemoryStorage, SharedStorage};
use sessionkeeper_core::{
    ApiRequest, Config, HostBindings, MemoryNavigator, Notice, Notifier, ReqwestTransport,
    SessionRuntime, SessionState,
};

/// Log file written when `--log-dir` is given
const LOG_FILE: &str = "sessionkeeper.log";

#[derive(Parser)]
#[command(name = "sessionkeeper", version, about = "Sign in to an API and manage the session")]
struct Cli {
    /// API base URL (overrides config and SESSIONKEEPER_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Where remembered sessions are kept
    #[arg(long, value_enum, default_value_t = StoreKind::File, global = true)]
    store: StoreKind,

    /// Also write logs to a file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    File,
    Keyring,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the stored session and show who is signed in
    Status,
    /// Sign in with a username or email
    Login {
        identifier: Option<String>,
        /// Keep the session after this command exits
        #[arg(long)]
        remember: bool,
    },
    /// Create an account and sign in
    Register {
        username: String,
        email: String,
        #[arg(long)]
        display_name: Option<String>,
        #[arg(long)]
        remember: bool,
    },
    /// End the session
    Logout,
    /// Complete a third-party sign-in from the URL the provider redirected to
    Callback { url: String },
    /// GET an API path with the current session
    Get { path: String },
}

/// Prints notices for the user on stderr.
struct ConsoleNotifier;

impl Notifier for ConsoleNotifier {
    fn notify(&self, notice: Notice) {
        eprintln!("{}", notice.message());
    }
}

/// Initialize the tracing subscriber for logging
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();
    guard
}

fn build_runtime(config: &Config, store: StoreKind, url: Url) -> Result<SessionRuntime> {
    let shared = match store {
        StoreKind::File => SharedStorage::new(FileStorage::in_dir(&config.cache_dir()?)),
        StoreKind::Keyring => SharedStorage::new(KeyringStorage::new()),
    };
    let transport = ReqwestTransport::new(&config.api_base_url, config.timings.request_timeout())
        .context("Failed to create HTTP client")?;

    Ok(SessionRuntime::new(
        config.clone(),
        HostBindings {
            transport: Arc::new(transport),
            durable: shared.open_tab(),
            ephemeral: Arc::new(MemoryStorage::new()),
            notifier: Arc::new(ConsoleNotifier),
            navigator: Arc::new(MemoryNavigator::new(url)),
        },
    ))
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(default) => print!("{label} [{default}]: "),
        None => print!("{label}: "),
    }
    io::stdout().flush()?;

    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let value = line.trim();
    Ok(match (value.is_empty(), default) {
        (true, Some(default)) => default.to_string(),
        _ => value.to_string(),
    })
}

fn describe(state: SessionState) -> &'static str {
    match state {
        SessionState::Unknown => "unknown",
        SessionState::Authenticated { persistent: true } => "signed in (remembered)",
        SessionState::Authenticated { persistent: false } => "signed in (this run only)",
        SessionState::Unauthenticated => "signed out",
    }
}

async fn run(cli: Cli, mut config: Config) -> Result<()> {
    let page = Url::parse(&config.api_base_url).context("Invalid API base URL")?;
    let url = match cli.command {
        Command::Callback { ref url } => Url::parse(url).context("Invalid callback URL")?,
        _ => page,
    };
    let runtime = build_runtime(&config, cli.store, url)?;
    let state = runtime.init().await;
    let session = runtime.controller();

    match cli.command {
        Command::Status | Command::Callback { .. } => {
            println!("{}", describe(state));
            if let Some(user) = session.current_user() {
                println!("user: {} ({})", user.display(), user.id);
            }
        }
        Command::Login { identifier, remember } => {
            let identifier = match identifier {
                Some(identifier) => identifier,
                None => prompt("Username or email", config.last_username.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ")?;
            let user = session.try_login(&identifier, &password, remember).await?;
            println!("Signed in as {}", user.display());

            config.last_username = Some(identifier);
            config.remember_me = remember;
            config.save()?;
        }
        Command::Register {
            username,
            email,
            display_name,
            remember,
        } => {
            let password = rpassword::prompt_password("Choose a password: ")?;
            let user = session
                .try_register(RegisterRequest {
                    username: username.clone(),
                    email,
                    password,
                    display_name,
                    remember_me: remember,
                })
                .await?;
            println!("Welcome, {}", user.display());

            config.last_username = Some(username);
            config.remember_me = remember;
            config.save()?;
        }
        Command::Logout => session.logout().await,
        Command::Get { path } => {
            let response = runtime.request(ApiRequest::get(path)).await?;
            match response.json::<serde_json::Value>() {
                Ok(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                Err(_) => println!("{}", response.body),
            }
        }
    }

    // Let the cross-tab signal clear before the process goes away.
    tokio::time::sleep(config.timings.cross_tab_clear_delay() * 2).await;
    runtime.dispose();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let _guard = init_tracing(cli.log_dir.as_deref());
    info!("sessionkeeper starting");

    let mut config = Config::load()?;
    config.apply_env();
    if let Some(ref url) = cli.api_url {
        config.api_base_url = url.clone();
    }

    run(cli, config).await
}
