//! `wiretap` CLI: spins up an ephemeral instance of the proxy engine, runs a
//! test command against it, and exits with that command's own exit status.
//!
//! `clap`-derived `Cli`, `tracing_subscriber` init, a multi-thread
//! `tokio::runtime::Builder` wrapping an async `main`: `wiretap -c "<test
//! command>" [-d]` runs the command once against the ephemeral proxy rather
//! than standing up a long-running server with subcommands.

use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use wiretap_proxy::config::Config;
use wiretap_proxy::engine::Engine;
use wiretap_proxy::server;

/// Runs a test command against an ephemeral programmable HTTP/WebSocket
/// proxy, forwarding the command's own exit code.
#[derive(Parser, Debug)]
#[command(name = "wiretap")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// The test command to run. Executed through the platform shell so
    /// pipelines and quoting behave the way a user typed them.
    #[arg(short = 'c', long = "command", value_name = "TEST COMMAND")]
    command: String,

    /// Enable debug logging and verbose event tagging on the engine.
    #[arg(short = 'd', long = "debug")]
    debug: bool,

    /// Optional bootstrap config (YAML or JSON) of initial rules and
    /// parameters, loaded before the command is spawned.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<std::path::PathBuf>,

    /// Address the HTTP/H2 listener binds. Defaults to an ephemeral port on
    /// the loopback interface, which is how this CLI is meant to be used.
    #[arg(long = "listen", default_value = "127.0.0.1:0")]
    listen: String,

    /// Address the admin duplex channel listener binds. Absent means no
    /// admin channel is started and the command only sees the bootstrap
    /// config's rules.
    #[arg(long = "channel-listen", value_name = "ADDR")]
    channel_listen: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        error!("failed to install default rustls crypto provider");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let engine = Arc::new(match build_engine(&cli) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "failed to build engine from bootstrap config");
            return ExitCode::FAILURE;
        }
    });
    engine.set_debug(cli.debug);

    let listen_addr: SocketAddr = match cli.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, addr = %cli.listen, "invalid --listen address");
            return ExitCode::FAILURE;
        }
    };

    let proxy_addr = match bind_and_spawn_proxy(engine.clone(), listen_addr).await {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "failed to start proxy listener");
            return ExitCode::FAILURE;
        }
    };
    info!(addr = %proxy_addr, "wiretap proxy listening");

    let channel_addr = match &cli.channel_listen {
        Some(raw) => match raw.parse::<SocketAddr>() {
            Ok(addr) => match bind_and_spawn_channel(engine.clone(), addr).await {
                Ok(bound) => {
                    info!(addr = %bound, "wiretap admin channel listening");
                    Some(bound)
                }
                Err(e) => {
                    error!(error = %e, "failed to start admin channel listener");
                    return ExitCode::FAILURE;
                }
            },
            Err(e) => {
                error!(error = %e, addr = %raw, "invalid --channel-listen address");
                return ExitCode::FAILURE;
            }
        },
        None => None,
    };

    run_command(&cli.command, proxy_addr, channel_addr).await
}

fn build_engine(cli: &Cli) -> wiretap_proxy::error::Result<Engine> {
    let engine = Engine::new();
    if let Some(path) = &cli.config {
        let config = Config::from_file(path)?;
        for (name, value) in config.parameters {
            engine.set_parameter(name, value);
        }
        let builders = config
            .rules
            .iter()
            .map(|wire| wiretap_proxy::channel::convert::rule_builder_from_wire(wire, None))
            .collect::<wiretap_proxy::error::Result<Vec<_>>>()?;
        engine.add_rules(builders, false)?;
    }
    Ok(engine)
}

async fn bind_and_spawn_proxy(
    engine: Arc<Engine>,
    addr: SocketAddr,
) -> wiretap_proxy::error::Result<SocketAddr> {
    let listener = server::bind(addr).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| wiretap_proxy::error::ProxyError::Validation(format!("could not read bound address: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = server::serve_listener(engine, listener).await {
            error!(error = %e, "proxy listener exited");
        }
    });
    Ok(bound)
}

async fn bind_and_spawn_channel(
    engine: Arc<Engine>,
    addr: SocketAddr,
) -> wiretap_proxy::error::Result<SocketAddr> {
    let listener = server::bind(addr).await?;
    let bound = listener
        .local_addr()
        .map_err(|e| wiretap_proxy::error::ProxyError::Validation(format!("could not read bound address: {e}")))?;
    tokio::spawn(async move {
        if let Err(e) = server::serve_admin_channel_listener(engine, listener).await {
            error!(error = %e, "admin channel listener exited");
        }
    });
    Ok(bound)
}

/// Spawns the test command through the platform shell, exposing the
/// proxy's bound address as both a generic `WIRETAP_URL` and the
/// conventional `HTTP_PROXY`/`HTTPS_PROXY` pair so unmodified HTTP clients
/// pick it up without extra configuration, then waits for it and translates
/// its `ExitStatus` into this process's own exit code.
async fn run_command(
    command: &str,
    proxy_addr: SocketAddr,
    channel_addr: Option<SocketAddr>,
) -> ExitCode {
    let proxy_url = format!("http://{proxy_addr}");

    let mut cmd = shell_command(command);
    cmd.env("WIRETAP_URL", &proxy_url);
    cmd.env("HTTP_PROXY", &proxy_url);
    cmd.env("HTTPS_PROXY", &proxy_url);
    cmd.env("http_proxy", &proxy_url);
    cmd.env("https_proxy", &proxy_url);
    if let Some(channel_addr) = channel_addr {
        cmd.env("WIRETAP_ADMIN_URL", format!("ws://{channel_addr}"));
    }
    cmd.stdin(std::process::Stdio::inherit());
    cmd.stdout(std::process::Stdio::inherit());
    cmd.stderr(std::process::Stdio::inherit());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(error = %e, %command, "failed to spawn test command");
            return ExitCode::FAILURE;
        }
    };

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            error!(error = %e, "failed to wait for test command");
            return ExitCode::FAILURE;
        }
    };

    exit_code_for(status)
}

#[cfg(unix)]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(not(unix))]
fn shell_command(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

/// Translates a child `ExitStatus` the way the design docs specify: the
/// command's own exit code (0-255) passed straight through, or `1` if the
/// command was killed by a signal rather than exiting normally.
#[cfg(unix)]
fn exit_code_for(status: std::process::ExitStatus) -> ExitCode {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => ExitCode::from(code as u8),
        None => {
            if let Some(signal) = status.signal() {
                error!(signal, "test command terminated by signal");
            }
            ExitCode::from(1)
        }
    }
}

#[cfg(not(unix))]
fn exit_code_for(status: std::process::ExitStatus) -> ExitCode {
    match status.code() {
        Some(code) => ExitCode::from(code as u8),
        None => ExitCode::from(1),
    }
}
