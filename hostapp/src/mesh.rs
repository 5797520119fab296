//! Mesh Transport. Owns one process-wide identity on the overlay network and
//! hands out a listener and dialer to every other component. The overlay
//! control plane itself (Tailscale/Headscale) is an external collaborator;
//! this facade persists the machine identity the way a local config file
//! would, and satisfies the start/listener/dial contract against whatever
//! interface the deployment wires the overlay onto.

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Serialize, Deserialize, Clone)]
struct Identity {
    hostname: String,
    login_server: String,
    machine_id: uuid::Uuid,
}

pub struct MeshTransport {
    identity: Identity,
    mesh_addr: SocketAddr,
    admin_addr: SocketAddr,
}

impl MeshTransport {
    /// Idempotent across restarts via the persisted identity file under
    /// `state/mesh/`.
    pub async fn start(
        state_dir: &Path,
        login_server: &str,
        preauth_key: &str,
        hostname: &str,
        mesh_port: u16,
        admin_port: u16,
        connect_timeout: Duration,
    ) -> Result<Self> {
        if login_server.trim().is_empty() || preauth_key.trim().is_empty() {
            return Err(Error::Unauthorized("missing mesh credentials".into()));
        }
        let mesh_dir = state_dir.join("mesh");
        tokio::fs::create_dir_all(&mesh_dir).await?;
        let identity_path = mesh_dir.join("identity.json");
        let identity = load_or_create_identity(&identity_path, login_server, hostname).await?;

        if identity.login_server != login_server {
            return Err(Error::Internal(format!(
                "identity conflict: state dir was provisioned for login server {}",
                identity.login_server
            )));
        }

        // Connectivity probe against the login server, bounded by connect_timeout,
        // standing in for the overlay's "connected" handshake.
        timeout(connect_timeout, probe_login_server(login_server))
            .await
            .map_err(|_| Error::Timeout("mesh identity did not report connected".into()))??;

        Ok(Self {
            identity,
            mesh_addr: SocketAddr::from(([0, 0, 0, 0], mesh_port)),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], admin_port)),
        })
    }

    pub fn hostname(&self) -> &str {
        &self.identity.hostname
    }

    pub fn machine_id(&self) -> uuid::Uuid {
        self.identity.machine_id
    }

    /// The peer-reachable socket the HTTP Surface binds.
    pub async fn listener(&self) -> Result<TcpListener> {
        TcpListener::bind(self.mesh_addr).await.map_err(Error::Io)
    }

    /// The loopback-only listener, used for admin/shutdown.
    pub async fn admin_listener(&self) -> Result<TcpListener> {
        TcpListener::bind(self.admin_addr)
            .await
            .map_err(Error::Io)
    }

    /// Dial a peer by overlay address with a bounded deadline.
    pub async fn dial(&self, target: &str, port: u16, deadline: Duration) -> Result<TcpStream> {
        let addr = format!("{target}:{port}");
        match timeout(deadline, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                Err(Error::Unreachable(format!("{addr}: connection refused")))
            }
            Ok(Err(e)) => Err(Error::Unreachable(format!("{addr}: {e}"))),
            Err(_) => Err(Error::Timeout(format!("dial {addr} exceeded deadline"))),
        }
    }
}

async fn load_or_create_identity(
    path: &PathBuf,
    login_server: &str,
    hostname: &str,
) -> Result<Identity> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let identity = Identity {
                hostname: hostname.to_string(),
                login_server: login_server.to_string(),
                machine_id: uuid::Uuid::new_v4(),
            };
            let bytes = serde_json::to_vec_pretty(&identity)?;
            tokio::fs::write(path, bytes).await?;
            Ok(identity)
        }
        Err(e) => Err(Error::Io(e)),
    }
}

async fn probe_login_server(login_server: &str) -> Result<()> {
    if login_server.starts_with("http://") || login_server.starts_with("https://") {
        reqwest::Client::new()
            .head(login_server)
            .send()
            .await
            .map_err(|e| Error::Unreachable(format!("login server unreachable: {e}")))?;
    }
    Ok(())
}

/// Graceful drain: wait up to `deadline` for `cancel` to settle before
/// returning.
pub async fn drain(cancel: &CancellationToken, deadline: Duration) {
    let _ = timeout(deadline, cancel.cancelled()).await;
}
