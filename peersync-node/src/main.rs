// peersync node: hosts a server or client session core over TCP.

mod client;
mod config;
mod server;
mod transport;

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::client::Action;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Host tick driving heartbeats, watchdogs and the eviction sweep.
pub(crate) const TICK: Duration = Duration::from_millis(100);

const USAGE: &str = "usage: peersync-node <server|client> [--config PATH] [--debug] \
[--set NAME=JSON] [--set-lazy NAME=JSON] [--read NAME] [--post PATH=JSON] [--once]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Server,
    Client,
}

#[derive(Debug, PartialEq)]
struct Args {
    mode: Mode,
    config: Option<PathBuf>,
    debug: bool,
    once: bool,
    actions: Vec<Action>,
}

/// `Ok(None)` means `--version` was handled.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Option<Args>> {
    let mut mode = None;
    let mut config = None;
    let mut debug = false;
    let mut once = false;
    let mut actions = Vec::new();
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| it.next().with_context(|| format!("{flag} needs a value"));
        match arg.as_str() {
            "--version" | "-V" => return Ok(None),
            "--debug" => debug = true,
            "--once" => once = true,
            "--config" => config = Some(PathBuf::from(value("--config")?)),
            "--set" => {
                let (name, value) = assignment(&value("--set")?)?;
                actions.push(Action::SetActive { name, value });
            }
            "--set-lazy" => {
                let (name, value) = assignment(&value("--set-lazy")?)?;
                actions.push(Action::SetLazy { name, value });
            }
            "--read" => actions.push(Action::ReadLazy {
                name: value("--read")?,
            }),
            "--post" => {
                let (path, body) = assignment(&value("--post")?)?;
                actions.push(Action::Post { path, body });
            }
            "server" if mode.is_none() => mode = Some(Mode::Server),
            "client" if mode.is_none() => mode = Some(Mode::Client),
            other => bail!("unexpected argument {other:?}\n{USAGE}"),
        }
    }
    let Some(mode) = mode else {
        bail!("{USAGE}");
    };
    if mode == Mode::Server && !actions.is_empty() {
        bail!("actions are only valid in client mode");
    }
    Ok(Some(Args {
        mode,
        config,
        debug,
        once,
        actions,
    }))
}

/// `name=json`; a value that is not valid JSON is taken as a string.
fn assignment(raw: &str) -> anyhow::Result<(String, Value)> {
    let (name, value) = raw
        .split_once('=')
        .with_context(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    if name.is_empty() {
        bail!("empty name in {raw:?}");
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((name.to_owned(), value))
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// Wall clock in ms; shared by timers and variable stamps.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn main() -> anyhow::Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        println!("peersync-node {}", VERSION);
        return Ok(());
    };
    init_logging(args.debug);
    let cfg = config::load(args.config.as_deref())?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async move {
        match args.mode {
            Mode::Server => server::run(cfg).await,
            Mode::Client => client::run(cfg, args.actions, args.once).await,
        }
    });
    // Let link writers flush the final disconnect frames.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

/// Wait for Ctrl+C or SIGTERM (Unix).
pub(crate) async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    tracing::info!("shutdown requested");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(args: &[&str]) -> anyhow::Result<Option<Args>> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn client_actions_in_order() {
        let args = parse(&[
            "client",
            "--set",
            "score=10",
            "--post",
            r#"sum={"a":2,"b":3}"#,
            "--read",
            "map",
            "--set-lazy",
            "mood=calm",
            "--once",
        ])
        .unwrap()
        .unwrap();
        assert_eq!(args.mode, Mode::Client);
        assert!(args.once);
        assert_eq!(
            args.actions,
            vec![
                Action::SetActive {
                    name: "score".into(),
                    value: json!(10)
                },
                Action::Post {
                    path: "sum".into(),
                    body: json!({"a": 2, "b": 3})
                },
                Action::ReadLazy { name: "map".into() },
                Action::SetLazy {
                    name: "mood".into(),
                    value: json!("calm")
                },
            ]
        );
    }

    #[test]
    fn server_with_config_and_debug() {
        let args = parse(&["--debug", "server", "--config", "/tmp/p.toml"]).unwrap().unwrap();
        assert_eq!(args.mode, Mode::Server);
        assert!(args.debug);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/p.toml")));
    }

    #[test]
    fn version_short_circuits() {
        assert!(parse(&["--version"]).unwrap().is_none());
    }

    #[test]
    fn bad_invocations_fail() {
        assert!(parse(&[]).is_err());
        assert!(parse(&["client", "--set"]).is_err());
        assert!(parse(&["client", "--set", "novalue"]).is_err());
        assert!(parse(&["server", "--post", "sum=1"]).is_err());
        assert!(parse(&["server", "client"]).is_err());
    }
}
