use std::{
    io,
    net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{config::ConnectionConfig, pool::BufferPool};

use super::{
    Connection, RawReturn, SocketLink, SocketLinks, ThreadPool, TransportError,
    frame::RequestRecord,
};

const WORKERS: usize = 15;

/// Sockets accepted in one non-blocking burst before they are started.
const ACCEPT_BATCH: usize = 64;

/// Server-side implementation of a call table.
///
/// `call` runs on a worker thread. Its result is sent back only when the client asked
/// for a response; for send-only calls it is dropped.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, request: &RequestRecord) -> RawReturn;
}

impl<F> Handler for F
where
    F: Fn(&RequestRecord) -> RawReturn + Send + Sync + 'static,
{
    fn call(&self, request: &RequestRecord) -> RawReturn {
        self(request)
    }
}

/// Everything a freshly accepted socket needs to become a connection.
pub(crate) struct ServerContext {
    pub(crate) config: Arc<ConnectionConfig>,
    pub(crate) buffers: Arc<BufferPool>,
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) workers: Arc<ThreadPool>,
}

pub struct RpcServer {
    listener: TcpListener,
    address: SocketAddr,
    context: ServerContext,
    links: SocketLinks,
    connections: Mutex<Vec<Connection>>,
    stopped: AtomicBool,
}

impl RpcServer {
    pub fn bind<A: ToSocketAddrs>(
        address: A,
        config: ConnectionConfig,
        handler: impl Handler,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let listener = TcpListener::bind(address)?;
        let address = listener.local_addr()?;
        let buffers = BufferPool::new(config.buffer_pool_capacity, config.send_buffer_size);

        Ok(Self {
            listener,
            address,
            context: ServerContext {
                config: Arc::new(config),
                buffers: Arc::new(buffers),
                handler: Arc::new(handler),
                workers: Arc::new(ThreadPool::new(WORKERS)?),
            },
            links: SocketLinks::new(),
            connections: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Live connections, pruned of disposed ones on every accept.
    pub fn connection_count(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| !c.is_disposed())
            .count()
    }

    /// Accepts connections until [`shutdown`](Self::shutdown) is called.
    pub fn serve(&self) -> Result<(), TransportError> {
        info!("listening at {}", self.address);

        for stream in self.listener.incoming() {
            if self.is_stopped() {
                break;
            }
            match stream {
                Ok(stream) => {
                    self.links.push(SocketLink::new(stream));
                    self.accept_burst()?;
                    self.start_links();
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }

        debug!("accept loop at {} stopped", self.address);
        Ok(())
    }

    /// Drains whatever else is already waiting on the listener without blocking.
    fn accept_burst(&self) -> Result<(), TransportError> {
        self.listener.set_nonblocking(true)?;
        for _ in 1..ACCEPT_BATCH {
            match self.listener.accept() {
                Ok((stream, _)) => self.links.push(SocketLink::new(stream)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("broken connection: {e:?}");
                    break;
                }
            }
        }
        self.listener.set_nonblocking(false)?;
        Ok(())
    }

    fn start_links(&self) {
        let started = self.links.start_all(&self.context);
        let mut connections = self.connections.lock();
        connections.retain(|c| !c.is_disposed());
        if self.is_stopped() {
            // Shutdown already swept the list; these are dropped, which disposes them.
            return;
        }
        for connection in &started {
            info!("accepted connection from {:?}", connection.peer_addr());
        }
        connections.extend(started);
    }

    /// Stops accepting, closes sockets that were accepted but not yet started and
    /// disposes every live connection. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let cancelled = self.links.cancel_all();
        let connections = std::mem::take(&mut *self.connections.lock());
        info!(
            "shutting down {}: {} connections, {cancelled} pending sockets",
            self.address,
            connections.len()
        );
        for connection in connections {
            connection.close();
        }

        // Wake the blocking accept so the loop can observe the flag.
        let mut wake = self.address;
        if wake.ip().is_unspecified() {
            wake.set_ip(match wake {
                SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
            });
        }
        if let Err(e) = TcpStream::connect(wake) {
            debug!("failed to wake accept loop: {e}");
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
