use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use settingsd::config::{format_config, Config};
use settingsd::daemon::client::{DaemonClient, ListenerEndpoint, ListenerEvent};
use settingsd::daemon::server::{default_daemon_dir, default_socket_path, DaemonServer};
use settingsd::logging::{init_logging, LogConfig, Verbosity};
use settingsd::sources::UnsetFlags;
use settingsd::{Value, ValueType};

#[derive(Parser)]
#[command(name = "settingsd")]
#[command(version)]
#[command(about = "Per-user configuration database daemon")]
#[command(
    long_about = "A daemon serving a hierarchical key/value configuration database over a Unix socket, with change listeners that survive daemon restarts."
)]
struct Cli {
    /// Daemon socket (default: ~/.local/share/settingsd/daemon.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Serve {
        /// Stay attached to the terminal instead of detaching
        #[arg(long)]
        foreground: bool,

        /// Increase stderr verbosity (-v info, -vv debug, -vvv trace)
        #[arg(short, long, action = clap::ArgAction::Count)]
        verbose: u8,

        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<String>,

        /// Directory for the saved-state log
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
    /// Print the value of a key
    Get {
        key: String,

        /// Locale for localized schema values
        #[arg(long)]
        locale: Option<String>,
    },
    /// Store a value
    Set {
        key: String,
        value: String,

        /// Type of the value
        #[arg(short = 't', long = "type", value_enum, default_value = "string")]
        value_type: PrimitiveType,
    },
    /// Remove a value
    Unset {
        key: String,

        /// Remove everything below the key as well
        #[arg(short, long)]
        recursive: bool,

        /// With --recursive, also clear schema associations
        #[arg(long, requires = "recursive")]
        schema_names: bool,
    },
    /// List the entries of a directory
    Ls {
        #[arg(default_value = "/")]
        dir: String,
    },
    /// List the subdirectories of a directory
    Dirs {
        #[arg(default_value = "/")]
        dir: String,
    },
    /// Print changes at or below a location until interrupted
    Watch { location: String },
    /// Write pending changes back to disk
    Sync,
    /// Show daemon status
    Status,
    /// Flush and reload every database
    Reload,
    /// Stop the daemon
    Shutdown,
    /// Show the current configuration
    Config,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PrimitiveType {
    String,
    Int,
    Float,
    Bool,
}

impl From<PrimitiveType> for ValueType {
    fn from(t: PrimitiveType) -> Self {
        match t {
            PrimitiveType::String => ValueType::String,
            PrimitiveType::Int => ValueType::Int,
            PrimitiveType::Float => ValueType::Float,
            PrimitiveType::Bool => ValueType::Bool,
        }
    }
}

/// Connect to the daemon, starting it when using the default socket.
async fn connect(socket: &Option<PathBuf>) -> Result<DaemonClient> {
    let client = match socket {
        Some(path) => DaemonClient::connect_to(path.clone()).await,
        None => DaemonClient::connect_or_start().await,
    };
    client.context("Failed to reach the settingsd daemon")
}

/// Connect only if a daemon is already running.
async fn connect_existing(socket: &Option<PathBuf>) -> Result<DaemonClient> {
    let path = socket.clone().unwrap_or_else(default_socket_path);
    DaemonClient::connect_to(path)
        .await
        .context("The settingsd daemon is not running")
}

async fn serve(
    socket: Option<PathBuf>,
    foreground: bool,
    verbose: u8,
    log_file: Option<String>,
    state_dir: Option<PathBuf>,
) -> Result<()> {
    if !foreground {
        return spawn_detached(socket, verbose, log_file, state_dir);
    }

    let _guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_count(verbose),
        log_file,
    });

    let config = Config::load().context("Failed to load configuration")?;
    let settings = config.daemon_settings(state_dir);

    let server = match socket {
        Some(path) => {
            let pid_path = path.with_extension("pid");
            DaemonServer::with_paths(path, pid_path, settings)
        }
        None => DaemonServer::new(settings),
    }
    .context("Failed to set up daemon")?;

    let handle = match server.run().await {
        Ok(handle) => handle,
        Err(e) if e.is_lock_failure() => {
            anyhow::bail!("{}", e);
        }
        Err(e) => return Err(e).context("Failed to start daemon"),
    };

    let reason = handle.wait().await;
    tracing::info!(?reason, "settingsd exited");
    Ok(())
}

fn spawn_detached(
    socket: Option<PathBuf>,
    verbose: u8,
    log_file: Option<String>,
    state_dir: Option<PathBuf>,
) -> Result<()> {
    use std::process::{Command, Stdio};

    let exe = std::env::current_exe().context("Failed to get current executable")?;
    let mut command = Command::new(exe);
    command.arg("serve").arg("--foreground");
    if let Some(path) = socket {
        command.arg("--socket").arg(path);
    }
    if verbose > 0 {
        command.arg(format!("-{}", "v".repeat(verbose as usize)));
    }
    if let Some(file) = log_file {
        command.arg("--log-file").arg(file);
    }
    if let Some(dir) = state_dir {
        command.arg("--state-dir").arg(dir);
    }

    let child = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to spawn daemon process")?;
    println!("settingsd started (pid {})", child.id());
    Ok(())
}

async fn watch(socket: &Option<PathBuf>, location: String) -> Result<()> {
    let mut client = connect(socket).await?;
    let (endpoint, mut events) =
        ListenerEndpoint::bind(&default_daemon_dir()).context("Failed to bind listener socket")?;
    let id = client
        .add_listener(
            &location,
            endpoint.token().clone(),
            Some("settingsd watch".to_string()),
        )
        .await
        .context("Failed to add listener")?;
    println!("Watching {} (connection {})", location, id);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ListenerEvent::Notified(n)) => match n.value {
                    Some(value) => println!("{} = {}", n.key, value),
                    None => println!("{} unset", n.key),
                },
                Some(ListenerEvent::Remapped(update)) => {
                    println!("Daemon restarted, connection {} is now {}", update.old_id, update.new_id);
                }
                Some(ListenerEvent::CachesDropped) => println!("Daemon reloaded"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    let current = endpoint.current_id(&client.database(), id);
    if let Err(e) = client.remove_listener(current).await {
        tracing::debug!("Failed to remove listener: {}", e);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket;

    match cli.command {
        Commands::Serve {
            foreground,
            verbose,
            log_file,
            state_dir,
        } => serve(socket, foreground, verbose, log_file, state_dir).await?,

        Commands::Get { key, locale } => {
            let mut client = connect(&socket).await?;
            let found = client.get(&key, locale.as_deref()).await?;
            match found.value {
                Some(value) if found.is_default => println!("{} (default)", value),
                Some(value) => println!("{}", value),
                None => println!("(unset)"),
            }
        }

        Commands::Set {
            key,
            value,
            value_type,
        } => {
            let value = Value::parse_primitive(value_type.into(), &value)?;
            let mut client = connect(&socket).await?;
            client.set(&key, value).await?;
        }

        Commands::Unset {
            key,
            recursive,
            schema_names,
        } => {
            let mut client = connect(&socket).await?;
            if recursive {
                let flags = UnsetFlags {
                    including_schema_names: schema_names,
                };
                client.recursive_unset(&key, flags).await?;
            } else {
                client.unset(&key, None).await?;
            }
        }

        Commands::Ls { dir } => {
            let mut client = connect(&socket).await?;
            for entry in client.all_entries(&dir, None).await? {
                match entry.value {
                    Some(value) => println!("{} = {}", entry.key, value),
                    None => println!("{} (no value)", entry.key),
                }
            }
        }

        Commands::Dirs { dir } => {
            let mut client = connect(&socket).await?;
            for name in client.all_dirs(&dir).await? {
                println!("{}/", name);
            }
        }

        Commands::Watch { location } => watch(&socket, location).await?,

        Commands::Sync => {
            let mut client = connect_existing(&socket).await?;
            client.synchronous_sync().await?;
        }

        Commands::Status => {
            let mut client = connect_existing(&socket).await?;
            let status = client.status().await?;
            println!("pid:        {}", status.pid);
            println!("started:    {}", status.started_at.to_rfc3339());
            println!("clients:    {}", status.clients);
            if status.in_shutdown {
                println!("state:      shutting down");
            }
            for db in status.databases {
                println!();
                println!("database {}", db.signature);
                for address in db.addresses {
                    println!("  source    {}", address);
                }
                println!("  listeners {}", db.listeners);
                println!("  syncs     {}", db.sync_count);
                if db.sync_pending {
                    println!("  (changes pending)");
                }
            }
        }

        Commands::Reload => {
            let mut client = connect_existing(&socket).await?;
            client.reload().await?;
            println!("Reloaded");
        }

        Commands::Shutdown => {
            let mut client = connect_existing(&socket).await?;
            client.shutdown().await?;
            println!("Daemon stopping");
        }

        Commands::Config => {
            let config = Config::load().context("Failed to load configuration")?;
            println!("{}", format_config(&config));
            if let Ok(path) = Config::config_path() {
                println!();
                println!("Config file: {}", path.display());
            }
        }
    }

    Ok(())
}
