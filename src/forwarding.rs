use std::sync::Arc;

use color_eyre::eyre::{WrapErr, eyre};
use russh::server::Handle;
use tokio::io::copy_bidirectional_with_sizes;
use tracing::{debug, info, warn};

use crate::{
    BurrowServer,
    addressing::tunnel_name_valid,
    buffer_pool::BUFFER_SIZE,
    droppable_handle::DroppableHandle,
    http::spawn_http_acceptor,
    registry::{ConnectionKind, HttpTunnel, NameOutcome, TcpAcquireError, join_host_port},
    ssh::SessionSender,
};

// Parsed exec command: a comma-separated list of key=value tokens. Tokens
// are case-insensitive and unknown ones are ignored. `subdomain` is the
// legacy spelling of `tunnelname`.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ExecArgs {
    pub(crate) client_id: String,
    pub(crate) tunnel_name: String,
    pub(crate) host_header: Option<String>,
    pub(crate) kind: String,
}

impl ExecArgs {
    pub(crate) fn parse(command: &str) -> Self {
        let mut args = ExecArgs::default();
        for token in command.split(',') {
            let token = token.trim().to_lowercase();
            if let Some(value) = token.strip_prefix("id=") {
                args.client_id = value.to_string();
            } else if let Some(value) = token
                .strip_prefix("tunnelname=")
                .or_else(|| token.strip_prefix("subdomain="))
            {
                args.tunnel_name = value.to_string();
            } else if let Some(value) = token.strip_prefix("type=") {
                args.kind = value.to_string();
            } else if let Some(value) = token.strip_prefix("header=") {
                args.host_header = Some(value.to_string());
            }
        }
        args
    }
}

pub(crate) struct ForwardContext {
    pub(crate) server: Arc<BurrowServer>,
    pub(crate) handle: Handle,
    pub(crate) tx: SessionSender,
    pub(crate) session_id: String,
    pub(crate) bind_addr: String,
    pub(crate) bind_port: u32,
    pub(crate) exec: ExecArgs,
}

pub(crate) struct CompletedForward {
    pub(crate) kind: ConnectionKind,
    // Registry key of the public endpoint ("bind_addr:port").
    pub(crate) addr_key: String,
    // Assigned tunnel name (HTTP only).
    pub(crate) name: String,
    // Port to marshal into the forward reply.
    pub(crate) public_port: u32,
}

// Reconcile the forward payload with the exec arguments and bring the
// public endpoint up. HTTP(S) forwards share one listener per bind address;
// TCP forwards get a dedicated listener and acceptor.
pub(crate) async fn serve_forward(context: ForwardContext) -> color_eyre::Result<CompletedForward> {
    let ForwardContext {
        server,
        handle,
        tx,
        session_id,
        bind_addr,
        bind_port,
        exec,
    } = context;
    let kind = match exec.kind.as_str() {
        "http" => ConnectionKind::Http,
        "https" => ConnectionKind::Https,
        // The original protocol treats an absent type as a raw TCP tunnel.
        "" | "tcp" => ConnectionKind::Tcp,
        other => {
            tx.send_line(format!("invalid connectionType {other}"));
            return Err(eyre!("invalid connection type {other:?}"));
        }
    };
    let client_id = if exec.client_id.is_empty() {
        debug!(%session_id, "Empty client id, using the session id.");
        session_id.clone()
    } else {
        exec.client_id.clone()
    };

    match kind {
        ConnectionKind::Http | ConnectionKind::Https => {
            serve_http_forward(ServeHttpForward {
                server,
                handle,
                tx,
                session_id,
                bind_addr,
                bind_port,
                client_id,
                requested_name: exec.tunnel_name,
                host_header: exec.host_header,
                kind,
            })
            .await
        }
        ConnectionKind::Tcp => {
            serve_tcp_forward(ServeTcpForward {
                server,
                handle,
                tx,
                session_id,
                bind_addr,
                bind_port,
                client_id,
            })
            .await
        }
    }
}

struct ServeHttpForward {
    server: Arc<BurrowServer>,
    handle: Handle,
    tx: SessionSender,
    session_id: String,
    bind_addr: String,
    bind_port: u32,
    client_id: String,
    requested_name: String,
    host_header: Option<String>,
    kind: ConnectionKind,
}

async fn serve_http_forward(forward: ServeHttpForward) -> color_eyre::Result<CompletedForward> {
    let ServeHttpForward {
        server,
        handle,
        tx,
        session_id,
        bind_addr,
        bind_port,
        client_id,
        requested_name,
        host_header,
        kind,
    } = forward;
    let addr = join_host_port(&bind_addr, bind_port);
    if !requested_name.is_empty() && !tunnel_name_valid(&requested_name) {
        info!(name = %requested_name, "Requested tunnel name is not valid.");
        tx.send_line(format!("Specified subdomain '{requested_name}' not valid"));
    }
    let tunnel = Arc::new(HttpTunnel {
        handle,
        tx: tx.clone(),
        bind_addr: bind_addr.clone(),
        bind_port,
        host_header,
        kind,
    });
    let (name, outcome) = server.registry.acquire_http(
        &addr,
        &requested_name,
        &client_id,
        &session_id,
        tunnel,
    );
    if outcome == NameOutcome::Taken {
        info!(name = %requested_name, "Requested tunnel name is already taken.");
        tx.send_line(format!("Specified subdomain '{requested_name}' already taken"));
    }
    info!(%name, %session_id, "Using tunnel name.");

    let domain = &server.domain;
    if domain.path_mode {
        tx.send_line(format!("{}/{}", domain.raw, name));
    } else {
        tx.send_line(format!("{}://{}.{}", domain.scheme, name, domain.host));
    }

    // The public HTTP listener is shared by every tunnel on this bind
    // address; bring it up on first use and keep it until shutdown.
    if let Some(listener) = server
        .registry
        .ensure_http_listener(&addr)
        .wrap_err_with(|| format!("Error listening for address {addr}"))?
    {
        info!(%addr, "Listening for public HTTP connections.");
        let task = spawn_http_acceptor(Arc::clone(&server), addr.clone(), listener);
        server.registry.set_listener_task(&addr, task);
    }

    Ok(CompletedForward {
        kind,
        addr_key: addr,
        name,
        public_port: bind_port,
    })
}

struct ServeTcpForward {
    server: Arc<BurrowServer>,
    handle: Handle,
    tx: SessionSender,
    session_id: String,
    bind_addr: String,
    bind_port: u32,
    client_id: String,
}

async fn serve_tcp_forward(forward: ServeTcpForward) -> color_eyre::Result<CompletedForward> {
    let ServeTcpForward {
        server,
        handle,
        tx,
        session_id,
        bind_addr,
        bind_port,
        client_id,
    } = forward;
    let (listener, port) =
        match server
            .registry
            .acquire_tcp(&bind_addr, bind_port, &client_id, &session_id)
        {
            Ok(bound) => bound,
            Err(TcpAcquireError::PortTaken(port)) => {
                tx.send_line(format!("TCP port {port} is already taken."));
                return Err(eyre!("TCP port {port} is already taken"));
            }
            Err(error) => {
                return Err(error).wrap_err_with(|| {
                    format!("Error listening for TCP address {bind_addr}:{bind_port}")
                });
            }
        };
    let addr_key = join_host_port(&bind_addr, port.into());
    tx.send_line(format!("{}:{port}", server.domain.host));

    let acceptor = {
        let label = format!("TCP acceptor for {addr_key}");
        let server = Arc::clone(&server);
        let tx = tx.clone();
        let bind_addr = bind_addr.clone();
        let session_id = session_id.clone();
        let addr_key = addr_key.clone();
        let cancellation_token = server.cancellation_token.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, address) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(error) => {
                            warn!(%addr_key, %error, "Error accepting TCP connection.");
                            break;
                        }
                    },
                    _ = cancellation_token.cancelled() => {
                        debug!(%addr_key, "TCP listener: cancellation requested.");
                        return;
                    }
                };
                tx.send_line(format!("Received tcp request from {address}"));
                let handle = handle.clone();
                let bind_addr = bind_addr.clone();
                tokio::spawn(async move {
                    let channel = match handle
                        .channel_open_forwarded_tcpip(
                            bind_addr,
                            port.into(),
                            address.ip().to_canonical().to_string(),
                            address.port().into(),
                        )
                        .await
                    {
                        Ok(channel) => channel,
                        Err(error) => {
                            warn!(%error, "Error opening forwarded-tcpip channel.");
                            return;
                        }
                    };
                    let mut stream = stream;
                    let mut channel = channel.into_stream();
                    let _ = copy_bidirectional_with_sizes(
                        &mut stream,
                        &mut channel,
                        BUFFER_SIZE,
                        BUFFER_SIZE,
                    )
                    .await;
                });
            }
            server.registry.release_tcp(&addr_key, &session_id);
        });
        DroppableHandle::new(task, label)
    };
    server.registry.set_listener_task(&addr_key, acceptor);

    Ok(CompletedForward {
        kind: ConnectionKind::Tcp,
        addr_key,
        name: String::new(),
        public_port: port.into(),
    })
}
