mod app;
pub mod config;
pub mod conflicts;
pub mod error;
pub mod matcher;
pub mod ports;
pub mod process;
pub mod project;
pub mod registry;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod tokens;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

pub use app::{APP_NAME, APP_VERSION};
use config::ControlConfig;
use state::ControlPlane;

/// Default port the dashboard asks the registry for
const DASHBOARD_PORT: u16 = 7777;

/// What the binary was asked to do; positional words only
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Status(Option<String>),
    Start(String),
    Stop(String),
    Restart(String),
    Port { service: String, preferred: u16 },
}

impl Command {
    fn from_args(args: &[String]) -> Result<Self> {
        let words: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(match words.as_slice() {
            [] | ["status"] | ["list"] | ["ls"] => Command::Status(None),
            ["status", name] => Command::Status(Some(name.to_string())),
            ["start", name] => Command::Start(name.to_string()),
            ["stop", name] => Command::Stop(name.to_string()),
            ["restart", name] => Command::Restart(name.to_string()),
            ["port", service] => Command::Port {
                service: service.to_string(),
                preferred: DASHBOARD_PORT,
            },
            ["port", service, preferred] => Command::Port {
                service: service.to_string(),
                preferred: preferred
                    .parse()
                    .with_context(|| format!("invalid port: {}", preferred))?,
            },
            other => bail!("unknown command: {}", other.join(" ")),
        })
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn dispatch(plane: &ControlPlane, command: Command) -> Result<()> {
    match command {
        Command::Status(name) => print_json(&plane.status(name.as_deref()).await?),
        Command::Start(name) => print_json(&plane.start(&name).await?),
        Command::Stop(name) => print_json(&plane.stop(&name).await?),
        Command::Restart(name) => print_json(&plane.restart(&name).await?),
        Command::Port { service, preferred } => {
            let port = plane.request_port(&service, preferred).await;
            print_json(&serde_json::json!({ "service": service, "port": port }))
        }
    }
}

pub fn run() -> Result<()> {
    // The log level lives in the config, so what loading found is reported once tracing is up
    let (config, source) = ControlConfig::load();

    // Logs go to stderr; stdout carries the JSON answer
    tracing_subscriber::fmt()
        .with_max_level(config.tracing_level())
        .with_writer(std::io::stderr)
        .init();
    source.log();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = Command::from_args(&args)?;
    info!("{} {} running {:?}", APP_NAME, APP_VERSION, command);

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    let plane = ControlPlane::new(config)?;
    runtime.block_on(dispatch(&plane, command))
}
