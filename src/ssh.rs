use std::{
    net::SocketAddr,
    sync::{Arc, atomic::Ordering},
};

use russh::{
    Channel, ChannelId, MethodKind, MethodSet,
    keys::{HashAlg, PublicKey},
    server::{Auth, Handler, Msg, Session},
};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    BurrowServer,
    droppable_handle::DroppableHandle,
    forwarding::{ExecArgs, ForwardContext, serve_forward},
    registry::{ConnectionKind, join_host_port},
};

// Sender for messages destined to the client's session channel (tunnel
// addresses, name conflicts, per-request notifications).
#[derive(Debug, Clone)]
pub(crate) struct SessionSender(pub(crate) UnboundedSender<Vec<u8>>);

impl SessionSender {
    pub(crate) fn send(&self, message: Vec<u8>) -> Result<(), std::io::Error> {
        self.0
            .send(message)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::BrokenPipe, error))
    }

    pub(crate) fn send_line(&self, message: impl AsRef<str>) {
        let _ = self.send(format!("{}\n", message.as_ref()).into_bytes());
    }
}

// The tunnel a completed forward registered, kept for cancellation and
// logging.
struct RegisteredTunnel {
    kind: ConnectionKind,
    addr_key: String,
    name: String,
}

// Per-connection SSH state.
pub(crate) struct ServerHandler {
    // The IP and port of this connection.
    peer: SocketAddr,
    // Hex identifier for this session, used for registry ownership checks.
    session_id: String,
    // Channel to communicate that this connection must be closed.
    cancellation_token: CancellationToken,
    // Sender for session channel messages; receiver is pumped by a task
    // once the client opens its session channel.
    tx: SessionSender,
    rx: Option<UnboundedReceiver<Vec<u8>>>,
    // ID of the single accepted session channel.
    channel_id: Option<ChannelId>,
    // Handle for the session channel pump task. Initially None.
    open_session_join_handle: Option<DroppableHandle<()>>,
    // The exec command, once received. Carries the tunnel parameters.
    exec: Option<ExecArgs>,
    exec_handled: bool,
    // The tcpip-forward payload, once received.
    pending_forward: Option<(String, u32)>,
    forward_completed: bool,
    registered: Option<RegisteredTunnel>,
    server: Arc<BurrowServer>,
}

pub(crate) trait Server {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler;
}

impl Server for Arc<BurrowServer> {
    fn new_client(
        &mut self,
        peer_address: SocketAddr,
        cancellation_token: CancellationToken,
    ) -> ServerHandler {
        let id = self.session_counter.fetch_add(1, Ordering::AcqRel);
        let (tx, rx) = mpsc::unbounded_channel();
        ServerHandler {
            peer: peer_address,
            session_id: format!("{id:x}"),
            cancellation_token,
            tx: SessionSender(tx),
            rx: Some(rx),
            channel_id: None,
            open_session_join_handle: None,
            exec: None,
            exec_handled: false,
            pending_forward: None,
            forward_completed: false,
            registered: None,
            server: Arc::clone(self),
        }
    }
}

impl ServerHandler {
    // Complete the forward once both the tcpip-forward payload and the exec
    // command have arrived, whichever came last. Returns the public port to
    // reply with when completion happens inside the forward request itself.
    async fn try_complete_forward(&mut self, session: &mut Session) -> Option<u32> {
        if self.forward_completed {
            return None;
        }
        let (Some(exec), Some((bind_addr, bind_port))) = (&self.exec, &self.pending_forward)
        else {
            return None;
        };
        self.forward_completed = true;
        let context = ForwardContext {
            server: Arc::clone(&self.server),
            handle: session.handle(),
            tx: self.tx.clone(),
            session_id: self.session_id.clone(),
            bind_addr: bind_addr.clone(),
            bind_port: *bind_port,
            exec: exec.clone(),
        };
        match serve_forward(context).await {
            Ok(completed) => {
                self.registered = Some(RegisteredTunnel {
                    kind: completed.kind,
                    addr_key: completed.addr_key,
                    name: completed.name,
                });
                Some(completed.public_port)
            }
            Err(error) => {
                warn!(
                    session = %self.session_id, peer = %self.peer, %error,
                    "Failed to set up forward.",
                );
                None
            }
        }
    }
}

impl Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::from([MethodKind::PublicKey].as_slice())),
            partial_success: false,
        })
    }

    // Public-key authentication against the authorized-keys allowlist.
    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.server.authorized_keys.is_authorized(public_key) {
            info!(
                %user, peer = %self.peer, session = %self.session_id,
                key = %public_key.fingerprint(HashAlg::Sha256),
                "SSH client authenticated.",
            );
            Ok(Auth::Accept)
        } else {
            warn!(
                %user, peer = %self.peer,
                key = %public_key.fingerprint(HashAlg::Sha256),
                "Unknown public key for session.",
            );
            Ok(Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            })
        }
    }

    // Accept a single session channel and pump queued messages into it.
    // Additional channels are rejected.
    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Some(mut rx) = self.rx.take() else {
            debug!(peer = %self.peer, "Rejecting extra session channel.");
            return Ok(false);
        };
        self.channel_id = Some(channel.id());
        let join_handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if channel.data(message.as_ref()).await.is_err() {
                    break;
                }
            }
        });
        self.open_session_join_handle = Some(DroppableHandle::new(
            join_handle,
            format!("session channel pump for session {}", self.session_id),
        ));
        Ok(true)
    }

    // Ctrl+C on the session channel disconnects the client.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel_id == Some(channel) && data == b"\x03" {
            self.cancellation_token.cancel();
        }
        Ok(())
    }

    // One exec request per session; its command carries the tunnel
    // parameters the forward handler needs.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channel_id != Some(channel) || self.exec_handled {
            return session.channel_failure(channel);
        }
        self.exec_handled = true;
        let command = String::from_utf8_lossy(data);
        debug!(session = %self.session_id, %command, "Received exec command.");
        self.exec = Some(ExecArgs::parse(&command));
        let result = session.channel_success(channel);
        self.try_complete_forward(session).await;
        result
    }

    // Remote forwarding request. When the exec command already arrived the
    // forward is completed right here and the reply carries the bound port;
    // otherwise the exec handler completes it and the reply echoes the
    // requested port.
    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        info!(
            session = %self.session_id, peer = %self.peer, address, port = *port,
            "Session forward requested.",
        );
        self.pending_forward = Some((address.to_string(), *port));
        if self.exec.is_some() {
            match self.try_complete_forward(session).await {
                Some(bound_port) => {
                    *port = bound_port;
                }
                None => return Ok(false),
            }
        }
        Ok(true)
    }

    // Release only what this session owns: its name under the shared HTTP
    // bind, or its dedicated TCP listener. The shared HTTP listener itself
    // stays up.
    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let key = join_host_port(address, port);
        if let Some(registered) = &self.registered
            && matches!(
                registered.kind,
                ConnectionKind::Http | ConnectionKind::Https
            )
            && registered.addr_key == key
        {
            self.server
                .registry
                .release_http(&registered.addr_key, &registered.name, &self.session_id);
            return Ok(true);
        }
        self.server.registry.release_tcp(&key, &self.session_id);
        Ok(true)
    }
}

impl Drop for ServerHandler {
    fn drop(&mut self) {
        info!(session = %self.session_id, peer = %self.peer, "Session ended.");
        self.server.registry.remove_session(&self.session_id);
    }
}
