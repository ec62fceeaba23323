use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::{AppSettings, Clap};
use orchd::{Era, NodeUuid};
use orchd_agent::AgentReceiver;
use orchd_transport::tls;
use orchd_transport::{Command, Connection, Response};
use orchd_tree::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::fmt;

#[derive(Clap)]
#[clap(setting = AppSettings::ColoredHelp)]
struct Opts {
    #[clap(long)]
    /// Controller address to connect to.
    controller: SocketAddr,
    #[clap(long, default_value = "agent_cert.pem")]
    /// PEM certificate chain presented to the controller.
    tls_cert: PathBuf,
    #[clap(long, default_value = "agent_key.pem")]
    /// PEM PKCS#8 private key matching `tls_cert`.
    tls_key: PathBuf,
    #[clap(long, default_value = "controller_ca.pem")]
    /// PEM root(s) the controller's certificate must chain to.
    controller_ca: PathBuf,
    #[clap(long)]
    /// This node's stable identifier, used on `SET_NODE_ERA` after a
    /// reboot. Omit on an ordinary restart.
    node_uuid: Option<String>,
    #[clap(long)]
    /// This incarnation's era, sent alongside `node_uuid`.
    era: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt::init();
    let opts = Opts::parse();

    let cert = tls::load_certs(&opts.tls_cert)?;
    let key = tls::load_private_key(&opts.tls_key)?;
    let controller_ca = tls::load_certs(&opts.controller_ca)?;
    let connector =
        tls::agent_connector(cert, key, &controller_ca).context("building agent TLS configuration")?;

    let tcp = TcpStream::connect(opts.controller)
        .await
        .with_context(|| format!("connecting to controller at {}", opts.controller))?;
    let server_name = tokio_rustls::rustls::ServerName::try_from("controller")
        .expect("static server name is valid");
    let tls_stream = connector.connect(server_name, tcp).await.context("TLS handshake")?;

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let connection = Connection::spawn(tls_stream, commands_tx);
    connection.spawn_keepalive();
    info!(addr = %opts.controller, "connected to controller");

    if let (Some(node_uuid), Some(era)) = (opts.node_uuid, opts.era) {
        let node_uuid = NodeUuid::new(parse_hex16(&node_uuid).context("parsing --node-uuid")?);
        let era = Era::new(parse_hex16(&era).context("parsing --era")?);
        connection.call(Command::SetNodeEra { era, node_uuid }).await.ok();
    }

    let receiver = Arc::new(Mutex::new(AgentReceiver::new(
        Value::mapping(std::iter::empty()),
        Value::mapping(std::iter::empty()),
    )));
    let callback = |configuration: &Value, state: &Value| {
        info!(?configuration, ?state, "adopted new configuration/state");
    };

    while let Some((request_id, command)) = commands_rx.recv().await {
        let response = match command {
            Command::Noop => None,
            Command::Version => Some(Response::Version {
                major: orchd::version::PROTOCOL_MAJOR_VERSION,
            }),
            Command::UpdateFull {
                configuration,
                configuration_generation,
                state,
                state_generation,
                ..
            } => {
                let generations = receiver.lock().unwrap().handle_update_full(
                    configuration,
                    configuration_generation,
                    state,
                    state_generation,
                    &callback,
                );
                Some(Response::Ack {
                    current_configuration_generation: generations.current_configuration_generation,
                    current_state_generation: generations.current_state_generation,
                })
            }
            Command::UpdateDiff {
                configuration_diff,
                start_configuration_generation,
                end_configuration_generation,
                state_diff,
                start_state_generation,
                end_state_generation,
                ..
            } => {
                let generations = receiver.lock().unwrap().handle_update_diff(
                    configuration_diff,
                    start_configuration_generation,
                    end_configuration_generation,
                    state_diff,
                    start_state_generation,
                    end_state_generation,
                    &callback,
                );
                Some(Response::Ack {
                    current_configuration_generation: generations.current_configuration_generation,
                    current_state_generation: generations.current_state_generation,
                })
            }
            other => {
                warn!(name = other.name(), "controller sent an unexpected command; ignoring");
                None
            }
        };
        if let Some(response) = response {
            connection.respond(request_id, response).await?;
        }
    }
    Ok(())
}

fn parse_hex16(s: &str) -> anyhow::Result<[u8; 16]> {
    let bytes = hex::decode(s)?;
    bytes.try_into().map_err(|_| anyhow::anyhow!("expected 16 bytes"))
}
