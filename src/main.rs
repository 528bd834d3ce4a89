//! pgvictoria: process entry.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info, warn};

use pgvictoria::config::{
    self, ConfigStore, DEFAULT_CONFIG_FILE_PATH, DEFAULT_USERS_FILE_PATH, MainConfiguration,
};
use pgvictoria::error::ConfigError;
use pgvictoria::logging::Logging;
use pgvictoria::security::FileSecretStore;

#[derive(Parser, Debug)]
#[command(name = "pgvictoria", version, about = "Tuning solution for PostgreSQL")]
struct Args {
    /// Path to the pgvictoria.conf file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Path to the pgvictoria_users.conf file
    #[arg(short = 'u', long = "users")]
    users: Option<PathBuf>,

    /// Directory containing all configuration files
    #[arg(short = 'D', long = "directory", env = "PGVICTORIA_CONFIG_DIR")]
    directory: Option<PathBuf>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(args) {
        eprintln!("pgvictoria: {e:#}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    if nix::unistd::Uid::effective().is_root() {
        bail!("using the root account is not allowed");
    }

    let (configuration_path, users_path) = resolve_paths(&args)?;

    let mut config = MainConfiguration::init();

    config::read_main_configuration(&mut config, &configuration_path)
        .with_context(|| format!("configuration not found: {}", configuration_path.display()))?;
    config.common.configuration_path = configuration_path.display().to_string();

    let secrets = FileSecretStore::new();
    if let Err(e) = config::read_users_configuration(&mut config, &users_path, &secrets) {
        match e {
            ConfigError::NotFound(_) => {
                bail!("USERS configuration not found: {}", users_path.display())
            }
            ConfigError::MasterKey => bail!("invalid master key file"),
            ConfigError::TooManyUsers(n) => {
                bail!("USERS: too many users defined {n} (max {})", pgvictoria::NUMBER_OF_USERS)
            }
            e => return Err(e.into()),
        }
    }
    config.common.users_path = users_path.display().to_string();

    let logging = Logging::start(&config.common).context("could not start logging")?;

    config::validate_main_configuration(&mut config)?;
    config::validate_users_configuration(&config)?;

    let pidfile = create_pidfile(&mut config)?;

    let store = Arc::new(ConfigStore::new(config));
    let result = serve(store.clone(), logging, secrets);

    remove_pidfile(&pidfile);

    result
}

fn resolve_paths(args: &Args) -> anyhow::Result<(PathBuf, PathBuf)> {
    let mut configuration_path = args.config.clone();
    let mut users_path = args.users.clone();

    if let Some(directory) = &args.directory {
        if directory == Path::new("/etc/pgvictoria") {
            warn!("using the default configuration directory {}, -D can be omitted", directory.display());
        }

        if !directory.is_dir() {
            bail!("configuration directory not found: {}", directory.display());
        }

        configuration_path = configuration_path.or_else(|| Some(directory.join("pgvictoria.conf")));
        users_path = users_path.or_else(|| Some(directory.join("pgvictoria_users.conf")));
    }

    Ok((
        configuration_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE_PATH)),
        users_path.unwrap_or_else(|| PathBuf::from(DEFAULT_USERS_FILE_PATH)),
    ))
}

/// Runs the signal loop: SIGHUP reloads the configuration, SIGINT and
/// SIGTERM shut down.
fn serve(store: Arc<ConfigStore>, logging: Logging, secrets: FileSecretStore) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("could not start runtime")?;

    runtime.block_on(async {
        let config = store.load();
        info!("Started on {}", config.host);
        debug!("Known users: {}", config.common.users.len());
        debug!("Known servers: {}", config.common.servers.len());

        let mut hangup = signal(SignalKind::hangup())?;
        let mut terminate = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("Reload requested");
                    match store.reload(&secrets, Some(&logging)) {
                        Ok(false) => info!("Reload applied"),
                        Ok(true) => warn!("Reload applied, restart required for some changes"),
                        Err(e) => error!("Reload failed, restart required: {e}"),
                    }
                }
                _ = terminate.recv() => break,
                r = tokio::signal::ctrl_c() => {
                    r?;
                    break;
                }
            }
        }

        info!("Shutdown");

        Ok::<_, anyhow::Error>(())
    })
}

/// Creates the PID file; a pre-existing file is fatal. The default path
/// derives from the Unix socket directory and the listen host.
fn create_pidfile(config: &mut MainConfiguration) -> anyhow::Result<PathBuf> {
    if config.pidfile.is_empty() {
        let host = if config.host == "*" { "all" } else { &config.host };
        config.pidfile = format!(
            "{}/pgvictoria.{host}.pid",
            config.unix_socket_dir.trim_end_matches('/')
        );
        debug!("PID file automatically set to: [{}]", config.pidfile);
    }

    let path = PathBuf::from(&config.pidfile);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o644);
    }

    let mut file = options.open(&path).with_context(|| {
        format!(
            "PID file [{}] exists, is there another instance running?",
            path.display()
        )
    })?;

    use std::io::Write;
    writeln!(file, "{}", std::process::id())
        .with_context(|| format!("could not write pidfile '{}'", path.display()))?;

    Ok(path)
}

fn remove_pidfile(path: &Path) {
    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
}
