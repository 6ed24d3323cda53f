//! Dyno client - command line entry point

use anyhow::Result;
use clap::{Parser, Subcommand};
use dyno_client::fs::walker::WalkOptions;
use dyno_client::session::metadata::MetadataStore;
use dyno_client::session::process::{HttpProcessApi, ProcessApi};
use dyno_client::session::{self, RemoteProcess, SessionContext};
use dyno_client::sync::{BuildRequest, HttpBackend, Pusher, SyncBackend};
use dyno_client::daemon::shutdown::ShutdownCoordinator;
use dyno_client::{config::Config, utils, DynoError};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build DIR remotely and print the slug URL
    Push {
        dir: Option<PathBuf>,

        /// Buildpack URL or local buildpack directory
        #[arg(short, long)]
        buildpack: Option<String>,

        /// Build environment variable
        #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
        env: Vec<(String, String)>,
    },

    /// Start a development dyno running DIR and attach to it
    Start {
        dir: Option<PathBuf>,

        /// Development app
        #[arg(short, long)]
        app: String,

        /// Buildpack URL or local buildpack directory
        #[arg(short, long)]
        buildpack: Option<String>,

        /// Attach to an already started process instead of starting one
        #[arg(long, value_name = "URL")]
        rendezvous: Option<String>,
    },

    /// Open a console on the development dyno running DIR
    Console { dir: Option<PathBuf> },
}

fn parse_env(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", raw)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    }
    .apply_env()?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::debug!("dyno v{}", env!("CARGO_PKG_VERSION"));

    let outcome = match args.command {
        Command::Push { dir, buildpack, env } => push(&config, dir, buildpack, env).await,
        Command::Start {
            dir,
            app,
            buildpack,
            rendezvous,
        } => start(&config, dir, app, buildpack, rendezvous).await,
        Command::Console { dir } => console(&config, dir).await,
    };

    let code = match outcome {
        Ok(()) => 0,
        Err(e) => {
            if !matches!(e, DynoError::UserInterrupt) {
                eprintln!("ERROR: {}", e);
            }
            e.exit_code()
        }
    };

    // A parked stdin read would otherwise hold the runtime open
    std::process::exit(code)
}

/// Print `message`, run `work`, then report how it went on the same line.
async fn action<T, F>(message: &str, work: F) -> dyno_client::Result<T>
where
    F: Future<Output = dyno_client::Result<T>>,
{
    eprint!("{}... ", message);
    let result = work.await;
    eprintln!("{}", if result.is_ok() { "done" } else { "failed" });
    result
}

/// Run `work` unless SIGINT or SIGTERM arrives first.
async fn interruptible<T, F>(work: F) -> dyno_client::Result<T>
where
    F: Future<Output = dyno_client::Result<T>>,
{
    interrupt_with(work, ShutdownCoordinator::new().wait_for_signal()).await
}

async fn interrupt_with<T, F, I>(work: F, interrupt: I) -> dyno_client::Result<T>
where
    F: Future<Output = dyno_client::Result<T>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        result = work => result,
        _ = interrupt => {
            eprintln!();
            Err(DynoError::UserInterrupt)
        }
    }
}

fn resolve_dir(dir: Option<PathBuf>) -> dyno_client::Result<PathBuf> {
    let dir = dir.unwrap_or_else(|| PathBuf::from("."));
    std::fs::canonicalize(&dir).map_err(|e| DynoError::file_system(dir, e))
}

fn pusher(config: &Config) -> dyno_client::Result<Pusher> {
    let backend: Arc<dyn SyncBackend> = Arc::new(HttpBackend::new(&config.backend)?);
    Ok(Pusher::new(
        backend,
        config.sync.workers,
        WalkOptions::with_metadata_dir(&config.sync.metadata_dir),
    ))
}

/// Sync `root`, build it remotely with the log on stdout, return the slug URL.
async fn build(
    pusher: &Pusher,
    config: &Config,
    root: &Path,
    buildpack: Option<&str>,
    env: BTreeMap<String, String>,
) -> dyno_client::Result<(String, String)> {
    let synced = action("Synchronizing local files", pusher.sync_directory(root)).await?;
    eprintln!(
        "{} files, {} needed, {} bytes uploaded",
        synced.manifest.len(),
        synced.needed,
        synced.uploaded.bytes
    );

    let buildpack_url = action(
        "Preparing buildpack",
        pusher.prepare_buildpack(buildpack, &config.session.buildpack_url),
    )
    .await?;

    let request = BuildRequest {
        env,
        buildpack: buildpack_url.clone(),
    };
    let mut stdout = tokio::io::stdout();
    let slug_url = pusher
        .build(&synced.manifest, &request, &mut stdout)
        .await?
        .ok_or_else(|| DynoError::Protocol("build response carried no slug url".into()))?;

    Ok((slug_url, buildpack_url))
}

async fn push(
    config: &Config,
    dir: Option<PathBuf>,
    buildpack: Option<String>,
    env: Vec<(String, String)>,
) -> dyno_client::Result<()> {
    let root = resolve_dir(dir)?;
    let pusher = pusher(config)?;

    let env = env.into_iter().collect();
    let (slug_url, _) = interruptible(build(&pusher, config, &root, buildpack.as_deref(), env)).await?;
    println!("{}", slug_url);
    Ok(())
}

async fn start(
    config: &Config,
    dir: Option<PathBuf>,
    app: String,
    buildpack: Option<String>,
    rendezvous: Option<String>,
) -> dyno_client::Result<()> {
    let root = resolve_dir(dir)?;
    let pusher = pusher(config)?;
    let context = SessionContext {
        root: root.clone(),
        metadata_dir: config.sync.metadata_dir.clone(),
        config: config.session.clone(),
        backend: Arc::clone(pusher.backend()),
    };

    // Attaching to a process someone else started skips the build
    if let Some(url) = rendezvous {
        return session::start(&context, &url, None).await;
    }

    let api: Arc<dyn ProcessApi> = Arc::new(HttpProcessApi::new(&config.api)?);
    // The session handles interrupts itself once it is up
    let started = interruptible(async {
        let (slug_url, buildpack_url) = build(&pusher, config, &root, buildpack.as_deref(), BTreeMap::new()).await?;

        action(
            &format!("Preparing development dyno on {}", app),
            api.release(&app, "Initial development dyno sync", &config.session.development_slug_url),
        )
        .await?;

        let env: BTreeMap<String, String> = [
            ("ANVIL_HOST".to_string(), config.backend.url.clone()),
            ("BUILDPACK_URL".to_string(), buildpack_url),
            ("SLUG_URL".to_string(), slug_url),
        ]
        .into_iter()
        .collect();

        action(
            "Starting development dyno",
            api.start(&app, &config.session.process_command, &env),
        )
        .await
    })
    .await?;
    eprintln!("http://localhost:{}", config.session.local_port);

    let remote = RemoteProcess {
        api,
        app,
        process: started.process,
    };
    session::start(&context, &started.rendezvous_url, Some(remote)).await
}

async fn console(config: &Config, dir: Option<PathBuf>) -> dyno_client::Result<()> {
    let root = resolve_dir(dir)?;
    let store = MetadataStore::new(&root, &config.sync.metadata_dir);
    session::console::reconnect(&store).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env() {
        assert_eq!(parse_env("RACK_ENV=development").unwrap(), ("RACK_ENV".into(), "development".into()));
        assert_eq!(parse_env("EMPTY=").unwrap(), ("EMPTY".into(), String::new()));
        assert_eq!(parse_env("A=b=c").unwrap(), ("A".into(), "b=c".into()));
        assert!(parse_env("novalue").is_err());
        assert!(parse_env("=x").is_err());
    }

    #[test]
    fn test_cli_parses_subcommands() {
        let args = Args::try_parse_from(["dyno", "push", "app", "-e", "A=1", "--buildpack", "bp"]).unwrap();
        match args.command {
            Command::Push { dir, buildpack, env } => {
                assert_eq!(dir, Some(PathBuf::from("app")));
                assert_eq!(buildpack.as_deref(), Some("bp"));
                assert_eq!(env, vec![("A".to_string(), "1".to_string())]);
            }
            other => panic!("unexpected {:?}", other),
        }

        let args = Args::try_parse_from(["dyno", "start", "-a", "myapp", "--log-level", "debug"]).unwrap();
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(matches!(args.command, Command::Start { ref app, .. } if app == "myapp"));

        assert!(Args::try_parse_from(["dyno", "start"]).is_err());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_work() {
        let work = std::future::pending::<dyno_client::Result<()>>();
        let result = interrupt_with(work, async {}).await;
        assert!(matches!(result, Err(DynoError::UserInterrupt)));
        assert_eq!(DynoError::UserInterrupt.exit_code(), 0);
    }

    #[tokio::test]
    async fn test_finished_work_is_not_interrupted() {
        let result = interrupt_with(async { Ok(7) }, std::future::pending()).await;
        assert_eq!(result.unwrap(), 7);
    }
}
