use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{AppSettings, Clap};
use orchd::AgentId;
use orchd_controller::BroadcastService;
use orchd_store::{InMemoryStore, SharedStore};
use orchd_transport::tls;
use orchd_transport::{Command, Connection, Response};
use orchd_tree::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};
use tracing_subscriber::fmt;

#[derive(Clap)]
#[clap(setting = AppSettings::ColoredHelp)]
struct Opts {
    #[clap(long, default_value = "0.0.0.0:4433")]
    /// Address to listen for agent connections on.
    listen: SocketAddr,
    #[clap(long, default_value = "controller_cert.pem")]
    /// PEM certificate chain presented to connecting agents.
    tls_cert: PathBuf,
    #[clap(long, default_value = "controller_key.pem")]
    /// PEM PKCS#8 private key matching `tls_cert`.
    tls_key: PathBuf,
    #[clap(long, default_value = "agent_ca.pem")]
    /// PEM root(s) that a connecting agent's certificate must chain to.
    agent_ca: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt::init();
    let opts = Opts::parse();

    let cert = tls::load_certs(&opts.tls_cert)?;
    let key = tls::load_private_key(&opts.tls_key)?;
    let agent_ca = tls::load_certs(&opts.agent_ca)?;
    let acceptor = tls::controller_acceptor(cert, key, &agent_ca)
        .context("building controller TLS configuration")?;

    let config_store: SharedStore = Arc::new(InMemoryStore::new(Value::mapping(std::iter::empty())));
    let service = BroadcastService::new(config_store, Value::mapping(std::iter::empty()));

    let listener = TcpListener::bind(opts.listen)
        .await
        .with_context(|| format!("binding {}", opts.listen))?;
    info!(addr = %opts.listen, "controller listening for agent connections");

    loop {
        let (stream, peer) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let service = service.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_agent(acceptor, stream, service).await {
                warn!(%peer, %error, "agent connection ended");
            }
        });
    }
}

async fn handle_agent(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    service: Arc<BroadcastService>,
) -> anyhow::Result<()> {
    let tls_stream = acceptor.accept(stream).await.context("TLS handshake")?;
    let agent_id = client_agent_id(&tls_stream)?;

    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel();
    let connection = Connection::spawn(tls_stream, commands_tx);
    connection.spawn_keepalive();
    service.on_agent_connected(agent_id, connection.clone()).await;

    while let Some((request_id, command)) = commands_rx.recv().await {
        if let Some(response) = handle_command(&service, agent_id, command).await {
            connection.respond(request_id, response).await?;
        }
    }
    service.on_agent_disconnected(agent_id).await;
    Ok(())
}

async fn handle_command(
    service: &Arc<BroadcastService>,
    agent_id: AgentId,
    command: Command,
) -> Option<Response> {
    match command {
        Command::Noop => None,
        Command::Version => Some(Response::Version {
            major: orchd::version::PROTOCOL_MAJOR_VERSION,
        }),
        Command::NodeState { fragments, .. } => {
            service.on_state_fragment(agent_id, fragments).await;
            Some(Response::Empty)
        }
        Command::SetNodeEra { era, node_uuid } => {
            service.on_set_node_era(node_uuid, era).await;
            Some(Response::Empty)
        }
        Command::SetBlockdeviceId {
            dataset_id,
            blockdevice_id,
        } => match service.on_set_blockdevice_id(dataset_id, blockdevice_id).await {
            Ok(()) => Some(Response::Empty),
            Err(domain_error) => Some(Response::Error(domain_error)),
        },
        Command::UpdateFull { .. } | Command::UpdateDiff { .. } => {
            warn!(%agent_id, "agent sent a controller-to-agent command; ignoring");
            None
        }
    }
}

/// Derives a stable connection identity from the agent's TLS client
/// certificate, since mutual TLS is how an agent's long-lived key
/// material is actually presented on the wire.
fn client_agent_id(stream: &tokio_rustls::server::TlsStream<TcpStream>) -> anyhow::Result<AgentId> {
    let (_, session) = stream.get_ref();
    let certs = session
        .peer_certificates()
        .context("agent presented no client certificate")?;
    let leaf = certs.first().context("empty client certificate chain")?;
    let digest = blake3::hash(&leaf.0);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest.as_bytes()[..16]);
    Ok(AgentId::new(bytes))
}
