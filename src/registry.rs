use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
};

use russh::server::Handle;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{
    addressing::{generate_random_name, resolve_bind_addr, tunnel_name_valid},
    droppable_handle::DroppableHandle,
    ssh::SessionSender,
    tcp_listener::bind_listener,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConnectionKind {
    Http,
    Https,
    Tcp,
}

// Live HTTP(S) tunnel: everything the demultiplexer needs to reach the
// owning SSH session.
pub(crate) struct HttpTunnel {
    // Handle to the SSH connection, for opening forwarded-tcpip channels.
    pub(crate) handle: Handle,
    // Sender to the session channel, for per-request client messages.
    pub(crate) tx: SessionSender,
    pub(crate) bind_addr: String,
    pub(crate) bind_port: u32,
    // Optional Host header override requested by the tenant.
    pub(crate) host_header: Option<String>,
    pub(crate) kind: ConnectionKind,
}

struct HttpEntry<H> {
    client_id: String,
    session_id: String,
    handler: H,
}

// A bound public listener: either one dedicated TCP tunnel, or the single
// shared HTTP listener. Dropping the acceptor task closes the socket.
struct BoundListener {
    client_id: String,
    session_id: String,
    kind: ConnectionKind,
    task: Option<DroppableHandle<()>>,
}

// Outcome of a requested tunnel name, so the caller can notify the client
// before announcing the final (possibly generated) name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum NameOutcome {
    Granted,
    Invalid,
    Taken,
}

// The two tunnel tables. Each sits behind its own mutex; lookups and
// mutations happen in one lock scope, and listener tasks removed from the
// table are dropped outside of it.
pub(crate) struct TunnelRegistry<H = Arc<HttpTunnel>> {
    http_tunnels: Mutex<HashMap<String, HttpEntry<H>>>,
    listeners: Mutex<HashMap<String, BoundListener>>,
}

impl<H: Clone> TunnelRegistry<H> {
    pub(crate) fn new() -> Self {
        TunnelRegistry {
            http_tunnels: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
        }
    }

    // Reserve a tunnel name under the given public bind address. The
    // requested name is granted when it is valid and either free or held by
    // an entry with the same client id (reclaim across reconnects);
    // otherwise random 4-character names are drawn until a free one is
    // found.
    pub(crate) fn acquire_http(
        &self,
        addr: &str,
        requested: &str,
        client_id: &str,
        session_id: &str,
        handler: H,
    ) -> (String, NameOutcome) {
        let mut tunnels = self.http_tunnels.lock().unwrap();
        let mut outcome = NameOutcome::Granted;
        let mut needs_generated = false;
        if tunnel_name_valid(requested) {
            match tunnels.get(&format!("{addr}{requested}")) {
                Some(entry) if entry.client_id == client_id => {
                    debug!(%client_id, name = %requested, "Reclaiming tunnel name for client.");
                }
                Some(_) => {
                    outcome = NameOutcome::Taken;
                    needs_generated = true;
                }
                None => (),
            }
        } else {
            outcome = NameOutcome::Invalid;
            needs_generated = true;
        }
        let mut name = requested.to_string();
        while needs_generated {
            name = generate_random_name();
            needs_generated = tunnels.contains_key(&format!("{addr}{name}"));
        }
        tunnels.insert(
            format!("{addr}{name}"),
            HttpEntry {
                client_id: client_id.to_string(),
                session_id: session_id.to_string(),
                handler,
            },
        );
        (name, outcome)
    }

    pub(crate) fn get_http(&self, addr: &str, name: &str) -> Option<H> {
        self.http_tunnels
            .lock()
            .unwrap()
            .get(&format!("{addr}{name}"))
            .map(|entry| entry.handler.clone())
    }

    // Delete a name only when the owning session matches, so a reconnect
    // cannot wipe a newer entry.
    pub(crate) fn release_http(&self, addr: &str, name: &str, session_id: &str) {
        let mut tunnels = self.http_tunnels.lock().unwrap();
        let key = format!("{addr}{name}");
        if tunnels
            .get(&key)
            .is_some_and(|entry| entry.session_id == session_id)
        {
            tunnels.remove(&key);
            info!(%session_id, name, "Purged HTTP tunnel for session.");
        }
    }

    // Bind a dedicated TCP listener. Port zero scans for the first free
    // public port; an existing binding owned by the same client is closed
    // and replaced, while any other owner rejects the request.
    pub(crate) fn acquire_tcp(
        &self,
        bind_addr: &str,
        bind_port: u32,
        client_id: &str,
        session_id: &str,
    ) -> Result<(TcpListener, u16), TcpAcquireError> {
        let mut replaced = None;
        let result = {
            let mut listeners = self.listeners.lock().unwrap();
            let mut port = bind_port;
            if port == 0 {
                port = (1000..=u32::from(u16::MAX))
                    .find(|candidate| {
                        !listeners.contains_key(&join_host_port(bind_addr, *candidate))
                    })
                    .ok_or(TcpAcquireError::NoFreePorts)?;
            }
            let key = join_host_port(bind_addr, port);
            let same_client = match listeners.get(&key) {
                Some(existing) if existing.client_id == client_id => true,
                Some(_) => return Err(TcpAcquireError::PortTaken(port)),
                None => false,
            };
            if same_client {
                debug!(%client_id, "Discarding existing TCP listener for same client id.");
                replaced = listeners.remove(&key);
            }
            let listener = resolve_bind_addr(bind_addr, port as u16)
                .and_then(bind_listener)
                .map_err(TcpAcquireError::Bind)?;
            let port = listener.local_addr().map_err(TcpAcquireError::Bind)?.port();
            listeners.insert(
                key,
                BoundListener {
                    client_id: client_id.to_string(),
                    session_id: session_id.to_string(),
                    kind: ConnectionKind::Tcp,
                    task: None,
                },
            );
            Ok((listener, port))
        };
        // Close the replaced listener outside the lock scope.
        drop(replaced);
        result
    }

    // Bind the shared public HTTP listener on its first use. Returns None
    // when a listener for this address already exists.
    pub(crate) fn ensure_http_listener(&self, addr: &str) -> io::Result<Option<TcpListener>> {
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(addr) {
            return Ok(None);
        }
        let (host, port) = split_host_port(addr);
        let listener = bind_listener(resolve_bind_addr(host, port)?)?;
        listeners.insert(
            addr.to_string(),
            BoundListener {
                client_id: String::new(),
                session_id: String::new(),
                kind: ConnectionKind::Http,
                task: None,
            },
        );
        Ok(Some(listener))
    }

    // Attach the acceptor task for a bound listener, so dropping the entry
    // tears the acceptor (and its socket) down.
    pub(crate) fn set_listener_task(&self, addr: &str, task: DroppableHandle<()>) {
        if let Some(entry) = self.listeners.lock().unwrap().get_mut(addr) {
            entry.task = Some(task);
        }
    }

    // Delete a dedicated TCP listener when the owning session matches. The
    // shared HTTP listener is never released this way.
    pub(crate) fn release_tcp(&self, addr: &str, session_id: &str) {
        let removed = {
            let mut listeners = self.listeners.lock().unwrap();
            if listeners.get(addr).is_some_and(|entry| {
                entry.kind == ConnectionKind::Tcp && entry.session_id == session_id
            }) {
                info!(%session_id, addr, "Purged TCP listener for session.");
                listeners.remove(addr)
            } else {
                None
            }
        };
        drop(removed);
    }

    // Clean up everything a finished session owns: its HTTP names and its
    // dedicated TCP listeners, but not the shared HTTP listener.
    pub(crate) fn remove_session(&self, session_id: &str) {
        self.http_tunnels
            .lock()
            .unwrap()
            .retain(|_, entry| entry.session_id != session_id);
        let removed: Vec<BoundListener> = {
            let mut listeners = self.listeners.lock().unwrap();
            let keys: Vec<String> = listeners
                .iter()
                .filter(|(_, entry)| {
                    entry.kind == ConnectionKind::Tcp && entry.session_id == session_id
                })
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter()
                .filter_map(|key| listeners.remove(key))
                .collect()
        };
        drop(removed);
    }
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum TcpAcquireError {
    #[error("TCP port {0} is already taken")]
    PortTaken(u32),
    #[error("no free ports available")]
    NoFreePorts,
    #[error("error binding TCP listener: {0}")]
    Bind(io::Error),
}

pub(crate) fn join_host_port(host: &str, port: u32) -> String {
    format!("{host}:{port}")
}

fn split_host_port(addr: &str) -> (&str, u16) {
    match addr.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().unwrap_or(0)),
        None => (addr, 0),
    }
}
