//! flotilla - fleet deployment coordinator
//!
//! **Hub** (`flotilla hub`): hosts git repositories over smart HTTP, tracks
//! connected drones, and fans operator requests out to them.
//!
//! **Drone** (`flotilla drone`): connects to a hub, mirrors its repositories,
//! checks out commits and supervises the commands it is asked to run.
//!
//! The remaining subcommands are operator tools that talk to a hub.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use flotilla::client::{Client, ClientError};
use flotilla::config::{self, ConfigError, FlotillaConfig};
use flotilla::drone::{describe_event, Drone, DroneConfig};
use flotilla::hub::{Hub, HubConfig, HubError, DEFAULT_CONTROL_PORT, DEFAULT_GIT_PORT};
use flotilla::protocol::{
    DeployRequest, DroneInfo, ProcessEvent, ScrollbackParams, SpawnRequest, TargetFields, TargetSelector,
};
use flotilla::session::SessionEvent;

/// flotilla - push code to a fleet of drones and keep it running
#[derive(ClapParser, Debug)]
#[command(name = "flotilla", version, about, long_about = None)]
struct Cli {
    /// TOML settings file with [hub] and [drone] tables
    #[arg(long, global = true, env = "FLOTILLA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the hub
    Hub {
        /// Control port drones and operators connect to
        #[arg(long)]
        port: Option<u16>,

        /// Git smart-HTTP port
        #[arg(long)]
        git_port: Option<u16>,

        /// Address to bind both listeners
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Shared fleet secret
        #[arg(long, env = "FLOTILLA_SECRET")]
        secret: Option<String>,

        /// Directory holding the hosted repositories
        #[arg(long)]
        basedir: Option<PathBuf>,
    },

    /// Run a drone
    Drone {
        /// Hub control address (host:port)
        #[arg(long, env = "FLOTILLA_HUB")]
        hub: Option<String>,

        /// Shared fleet secret
        #[arg(long, env = "FLOTILLA_SECRET")]
        secret: Option<String>,

        /// Directory for mirrors and checkouts
        #[arg(long)]
        basedir: Option<PathBuf>,

        /// Identity to propose to the hub
        #[arg(long)]
        identity: Option<String>,
    },

    /// Check out a commit on drones
    Deploy {
        #[command(flatten)]
        conn: HubArgs,

        #[command(flatten)]
        target: TargetArgs,

        repo: String,
        commit: String,
    },

    /// Deploy a commit and run a command from it on drones
    Spawn {
        #[command(flatten)]
        conn: HubArgs,

        #[command(flatten)]
        target: TargetArgs,

        /// Scrollback kept for the process, in bytes
        #[arg(long)]
        scrollback: Option<usize>,

        /// Extra environment for the command (KEY=VALUE, repeatable)
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Keep streaming output until every process has exited for good
        #[arg(long)]
        follow: bool,

        repo: String,
        commit: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// List processes on every drone
    Ps {
        #[command(flatten)]
        conn: HubArgs,
    },

    /// List connected drones
    Drones {
        #[command(flatten)]
        conn: HubArgs,
    },

    /// Stop a process
    Stop {
        #[command(flatten)]
        conn: HubArgs,

        #[arg(long)]
        drone: String,

        id: String,
    },

    /// Restart a process
    Restart {
        #[command(flatten)]
        conn: HubArgs,

        #[arg(long)]
        drone: String,

        id: String,
    },

    /// Print a process's buffered output
    Logs {
        #[command(flatten)]
        conn: HubArgs,

        #[arg(long)]
        drone: String,

        /// First chunk to return
        #[arg(long, default_value_t = 0)]
        offset: usize,

        /// Most chunks to return
        #[arg(long, default_value_t = 100)]
        limit: usize,

        id: String,
    },

    /// Forget stopped processes that have exited
    Gc {
        #[command(flatten)]
        conn: HubArgs,

        /// Only this drone (default: every drone)
        #[arg(long)]
        drone: Option<String>,
    },
}

#[derive(Args, Debug)]
struct HubArgs {
    /// Hub control address (host:port)
    #[arg(long, env = "FLOTILLA_HUB")]
    hub: Option<String>,

    /// Shared fleet secret
    #[arg(long, env = "FLOTILLA_SECRET")]
    secret: Option<String>,
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Target one drone
    #[arg(long, conflicts_with = "drones")]
    drone: Option<String>,

    /// Target several drones (comma separated)
    #[arg(long, value_delimiter = ',')]
    drones: Option<Vec<String>>,
}

impl TargetArgs {
    fn fields(self) -> TargetFields {
        TargetFields {
            drone: self.drone,
            drones: self.drones,
        }
    }
}

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("hub error: {0}")]
    Hub(#[from] HubError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("no {0} given (flag, environment or config file)")]
    Missing(&'static str),

    #[error("drone session ended: {0}")]
    DroneSession(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn parse_env_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {:?}", s)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("flotilla: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "flotilla=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn run(cli: Cli) -> Result<ExitCode, FlotillaError> {
    let file = match &cli.config {
        Some(path) => FlotillaConfig::load(path)?,
        None => FlotillaConfig::default(),
    };

    match cli.command {
        Commands::Hub {
            port,
            git_port,
            bind,
            secret,
            basedir,
        } => run_hub(&file, port, git_port, bind, secret, basedir).await,
        Commands::Drone {
            hub,
            secret,
            basedir,
            identity,
        } => run_drone(&file, hub, secret, basedir, identity).await,
        Commands::Deploy {
            conn,
            target,
            repo,
            commit,
        } => {
            let client = connect(&file, conn).await?;
            let request = DeployRequest {
                repo,
                commit,
                target: target.fields(),
            };
            let report = client.deploy(request).await?;
            client.close().await;
            if report.results.is_empty() {
                println!("no drones targeted");
            }
            let mut failed = false;
            for result in &report.results {
                match (&result.error, &result.report) {
                    (Some(error), _) => {
                        failed = true;
                        println!("{}: error: {}", result.drone, error);
                    }
                    (None, Some(report)) if report.ok => {
                        println!("{}: deployed {}", result.drone, report.dir.as_deref().unwrap_or(""));
                    }
                    (None, Some(report)) => {
                        failed = true;
                        println!(
                            "{}: failed at {} (code {:?}, signal {:?})",
                            result.drone,
                            report.step.as_deref().unwrap_or("?"),
                            report.code,
                            report.signal
                        );
                    }
                    (None, None) => println!("{}: no report", result.drone),
                }
            }
            Ok(if failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
        }
        Commands::Spawn {
            conn,
            target,
            scrollback,
            env,
            follow,
            repo,
            commit,
            command,
        } => {
            let client = connect(&file, conn).await?;
            let target = target.fields();
            let expected = expected_targets(&target.selector(), &client.drones().await?);
            let request = SpawnRequest {
                repo,
                commit,
                command,
                env: env.into_iter().collect(),
                scrollback,
                target,
            };
            let code = run_spawn(&client, request, expected, follow).await?;
            client.close().await;
            Ok(code)
        }
        Commands::Ps { conn } => {
            let client = connect(&file, conn).await?;
            let mut records = client.ps();
            while let Some(record) = records.next().await {
                let record = record?;
                if let Some(error) = &record.error {
                    println!("{}: error: {}", record.drone, error);
                    continue;
                }
                for p in &record.processes {
                    println!(
                        "{}\t{}\t{}\t{}.{}\tpid={}\texits={}\t{}",
                        record.drone,
                        p.id,
                        p.status,
                        p.repo,
                        p.commit,
                        p.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                        p.exits,
                        p.command.join(" ")
                    );
                }
            }
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Drones { conn } => {
            let client = connect(&file, conn).await?;
            for drone in client.drones().await? {
                println!(
                    "{}\t{}\t{}",
                    drone.identity,
                    drone.hostname.as_deref().unwrap_or("-"),
                    drone.capabilities.join(",")
                );
            }
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stop { conn, drone, id } => {
            let client = connect(&file, conn).await?;
            let info = client.stop(&drone, &id).await?;
            println!("{} {}", info.id, info.status);
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restart { conn, drone, id } => {
            let client = connect(&file, conn).await?;
            let info = client.restart(&drone, &id).await?;
            println!("{} {}", info.id, info.status);
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs {
            conn,
            drone,
            offset,
            limit,
            id,
        } => {
            let client = connect(&file, conn).await?;
            let slice = client.scrollback(&drone, ScrollbackParams { id, offset, limit }).await?;
            client.close().await;
            use std::io::Write;
            let mut stdout = std::io::stdout().lock();
            for chunk in &slice.chunks {
                stdout.write_all(chunk)?;
            }
            stdout.flush()?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Gc { conn, drone } => {
            let client = connect(&file, conn).await?;
            for record in client.gc(drone.as_deref()).await? {
                match &record.error {
                    Some(error) => println!("{}: error: {}", record.drone, error),
                    None => println!("{}: removed {}", record.drone, record.removed.len()),
                }
            }
            client.close().await;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ── Hub ────────────────────────────────────────────────────────────

async fn run_hub(
    file: &FlotillaConfig,
    port: Option<u16>,
    git_port: Option<u16>,
    bind: IpAddr,
    secret: Option<String>,
    basedir: Option<PathBuf>,
) -> Result<ExitCode, FlotillaError> {
    let section = file.hub();
    let secret = secret.or(section.secret).ok_or(FlotillaError::Missing("secret"))?;
    let basedir = basedir.or(section.basedir).ok_or(FlotillaError::Missing("basedir"))?;

    let config = HubConfig {
        bind,
        control_port: port.or(section.port).unwrap_or(DEFAULT_CONTROL_PORT),
        git_port: git_port.or(section.git_port).unwrap_or(DEFAULT_GIT_PORT),
        secret,
        basedir,
        hostname: Some(config::resolve_hostname(section.hostname.as_deref())),
    };
    let hub = Hub::start(config).await?;
    eprintln!("Listening on {} (git on {})", hub.control_addr(), hub.git_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(?e, "failed to listen for Ctrl+C");
    }
    tracing::info!("received Ctrl+C");
    hub.shutdown().await;
    Ok(ExitCode::SUCCESS)
}

// ── Drone ──────────────────────────────────────────────────────────

async fn run_drone(
    file: &FlotillaConfig,
    hub: Option<String>,
    secret: Option<String>,
    basedir: Option<PathBuf>,
    identity: Option<String>,
) -> Result<ExitCode, FlotillaError> {
    let section = file.drone();
    let config = DroneConfig {
        hub: hub.or(section.hub).ok_or(FlotillaError::Missing("hub address"))?,
        secret: secret.or(section.secret).ok_or(FlotillaError::Missing("secret"))?,
        basedir: basedir.or(section.basedir).ok_or(FlotillaError::Missing("basedir"))?,
        identity: identity.or(section.identity),
        hostname: Some(config::resolve_hostname(section.hostname.as_deref())),
        reconnect_interval: Duration::from_millis(section.reconnect_interval_ms),
        respawn_delay: Duration::from_millis(section.respawn_delay_ms),
        scrollback_bytes: section.scrollback_bytes,
    };
    tokio::fs::create_dir_all(&config.basedir).await?;

    let drone = Drone::start(config);
    let mut session_events = drone.session().subscribe();

    if let Some(mut log) = drone.supervisor().broker().take_log() {
        let supervisor = drone.supervisor().clone();
        tokio::spawn(async move {
            while let Some(event) = log.recv().await {
                let info = event.process_id().and_then(|id| supervisor.info(id).ok());
                if let Some(line) = describe_event(info.as_ref(), &event) {
                    println!("{}", line);
                }
            }
        });
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received Ctrl+C");
                break Ok(ExitCode::SUCCESS);
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::Up(descriptor)) => println!("connected as {}", descriptor.identity),
                Ok(SessionEvent::Down) => println!("disconnected"),
                Ok(SessionEvent::Reconnecting) => println!("reconnecting"),
                Ok(SessionEvent::Denied(reason)) => {
                    break Err(FlotillaError::DroneSession(format!("denied: {}", reason)));
                }
                Ok(SessionEvent::Closed) => break Err(FlotillaError::DroneSession("closed".into())),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    break Err(FlotillaError::DroneSession("closed".into()));
                }
            },
        }
    };
    drone.shutdown().await;
    outcome
}

// ── Operator ───────────────────────────────────────────────────────

async fn connect(file: &FlotillaConfig, args: HubArgs) -> Result<Client, FlotillaError> {
    let section = file.drone();
    let hub = args
        .hub
        .or(section.hub)
        .unwrap_or_else(|| format!("127.0.0.1:{}", DEFAULT_CONTROL_PORT));
    let secret = args
        .secret
        .or(section.secret)
        .or(file.hub().secret)
        .ok_or(FlotillaError::Missing("secret"))?;
    Ok(Client::connect(&hub, &secret).await?)
}

/// Drones a spawn will actually reach, given who is connected now.
fn expected_targets(selector: &TargetSelector, live: &[DroneInfo]) -> usize {
    let live: HashSet<&str> = live.iter().map(|d| d.identity.as_str()).collect();
    match selector {
        TargetSelector::One(identity) => usize::from(live.contains(identity.as_str())),
        TargetSelector::Set(identities) => identities
            .iter()
            .map(String::as_str)
            .filter(|i| live.contains(i))
            .collect::<HashSet<_>>()
            .len(),
        TargetSelector::Random => usize::from(!live.is_empty()),
    }
}

async fn run_spawn(
    client: &Client,
    request: SpawnRequest,
    expected: usize,
    follow: bool,
) -> Result<ExitCode, FlotillaError> {
    if expected == 0 && !follow {
        println!("no drones targeted");
        return Ok(ExitCode::SUCCESS);
    }

    let mut events = client.spawn(request);
    let mut reported: HashSet<String> = HashSet::new();
    let mut failed = false;
    let mut last_code: Option<i32> = None;

    while let Some(event) = events.next().await {
        let event = event?;
        let drone = event.drone.clone();
        match &event.event {
            ProcessEvent::Spawn { id, pid } => {
                println!(
                    "{}: spawned {} (pid {})",
                    drone,
                    id,
                    pid.map(|p| p.to_string()).unwrap_or_else(|| "?".into())
                );
            }
            ProcessEvent::Data { data, .. } => {
                if follow {
                    for line in String::from_utf8_lossy(data).lines() {
                        println!("{}: {}", drone, line);
                    }
                }
            }
            ProcessEvent::Exit {
                id,
                code,
                signal,
                respawning,
            } => {
                println!(
                    "{}: {} exited (code {:?}, signal {:?}){}",
                    drone,
                    id,
                    code,
                    signal,
                    if *respawning { ", respawning" } else { "" }
                );
                last_code = match (code, signal) {
                    (Some(code), _) => Some(*code),
                    (None, Some(signal)) => Some(128 + signal),
                    (None, None) => last_code,
                };
            }
            ProcessEvent::Failed { report } => {
                failed = true;
                println!(
                    "{}: deploy failed at {} (code {:?}, signal {:?})",
                    drone,
                    report.step.as_deref().unwrap_or("?"),
                    report.code,
                    report.signal
                );
                last_code = report.code.or(Some(1));
            }
            ProcessEvent::Error { message } => {
                failed = true;
                println!("{}: error: {}", drone, message);
            }
        }
        reported.insert(drone);
        if !follow && reported.len() >= expected {
            break;
        }
    }

    if follow {
        return Ok(exit_code(last_code.unwrap_or(0)));
    }
    Ok(if failed { exit_code(last_code.unwrap_or(1)) } else { ExitCode::SUCCESS })
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1))
}
