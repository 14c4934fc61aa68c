//! TCP server that answers codec-framed calls from a [`Registry`].
//!
//! Accepts on the tokio runtime and hands every connection to the blocking
//! pool, where [`serve_codec`] reads one call, dispatches it and writes the
//! reply before reading the next.
//!
//! # Thread Safety
//!
//! Each connection owns its codec and one of `MAX_CONNECTIONS` semaphore
//! permits. On shutdown the accept loop stops and every live codec is closed
//! from the async side, which unblocks its serving thread.

use crate::codec::{BinaryCodec, Codec, Header};
use crate::config::ServerConfig;
use crate::registry::Registry;
use crate::{Result, RpcError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore, TryAcquireError};
use tracing::{debug, error, info, warn};

/// Serve calls from `codec` until the peer disconnects or the stream fails.
///
/// Unknown methods and failing handlers are answered with `Header.error`
/// set; transport failures end the loop. The codec is closed on return.
pub fn serve_codec<C: Codec + ?Sized>(registry: &Registry, codec: &C) -> Result<()> {
    let result = serve_loop(registry, codec);
    let _ = codec.close();
    match result {
        Err(e) if e.is_eof() || matches!(e, RpcError::Closed) => Ok(()),
        other => other,
    }
}

fn serve_loop<C: Codec + ?Sized>(registry: &Registry, codec: &C) -> Result<()> {
    loop {
        let mut header = Header::default();
        codec.read_header(&mut header)?;

        let method = match registry.lookup(&header.service_method) {
            Ok((_, method)) => method,
            Err(e) => {
                codec.discard_body()?;
                warn!("Rejecting call {} (seq {}): {}", header.service_method, header.seq, e);
                header.error = e.to_string();
                codec.write(&header, &())?;
                continue;
            }
        };

        let mut arg = method.new_arg_value();
        codec.read_body(arg.as_mut())?;
        let mut reply = method.new_reply_value();

        debug!("RPC call: {} (seq {})", header.service_method, header.seq);
        match method.call(arg.as_ref(), reply.as_mut()) {
            Ok(()) => codec.write(&header, reply.as_ref())?,
            Err(e) => {
                header.error = e.to_string();
                codec.write(&header, &())?;
            }
        }
    }
}

/// Handle to a running RPC server. Dropping shuts down the server.
pub struct RpcServerHandle {
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    connection_slots: Arc<Semaphore>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
}

impl RpcServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        ServerConfig::MAX_CONNECTIONS.saturating_sub(self.connection_slots.available_permits())
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}

impl Drop for RpcServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

/// TCP listener for codec connections.
pub struct RpcServer;

impl RpcServer {
    /// Bind `addr` (port 0 picks a free port) and serve in background tasks.
    pub async fn start(registry: Arc<Registry>, addr: SocketAddr) -> Result<RpcServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("RPC server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connection_slots = Arc::new(Semaphore::new(ServerConfig::MAX_CONNECTIONS));

        let accept_task = tokio::spawn(Self::accept_loop(
            listener,
            registry,
            shutdown_rx,
            connection_slots.clone(),
        ));

        Ok(RpcServerHandle {
            addr,
            shutdown_tx,
            connection_slots,
            accept_task: Some(accept_task),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        registry: Arc<Registry>,
        mut shutdown_rx: watch::Receiver<bool>,
        connection_slots: Arc<Semaphore>,
    ) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown_rx.wait_for(|stop| *stop) => {
                    info!("RPC server shutting down");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("RPC accept error: {}", e);
                        continue;
                    }
                },
            };

            // The permit is held for the life of the connection.
            let slot = match connection_slots.clone().try_acquire_owned() {
                Ok(slot) => slot,
                Err(TryAcquireError::NoPermits) => {
                    warn!(
                        "Rejecting RPC connection from {}: {} connections open",
                        peer_addr,
                        ServerConfig::MAX_CONNECTIONS
                    );
                    continue;
                }
                Err(TryAcquireError::Closed) => return,
            };

            let registry = registry.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                debug!("RPC connection from {}", peer_addr);
                if let Err(e) = Self::handle_connection(stream, registry, shutdown_rx).await {
                    debug!("RPC connection {} ended: {}", peer_addr, e);
                }
                drop(slot);
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        registry: Arc<Registry>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        // One small reply per call; don't let Nagle hold it back.
        stream.set_nodelay(true)?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;
        let codec = Arc::new(BinaryCodec::new(stream)?);

        let serving = tokio::task::spawn_blocking({
            let codec = codec.clone();
            move || serve_codec(&registry, &*codec)
        });

        tokio::select! {
            joined = serving => {
                joined.map_err(|e| RpcError::Io {
                    message: format!("connection task failed: {}", e),
                    source: None,
                })?
            }
            // A dropped handle counts as shutdown too.
            _ = shutdown_rx.wait_for(|stop| *stop) => {
                codec.close()
            }
        }
    }
}
