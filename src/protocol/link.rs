//! Accepted sockets waiting to be started.
//!
//! The accept loop takes sockets off the listener in batches. Each one is recorded as a
//! [`SocketLink`] in an intrusive singly linked list and only then turned into a
//! [`Connection`]. A link owns its socket until it is started or cancelled; both consume
//! the link, move the socket out and hand back the rest of the list, so a socket is never
//! owned by two components at once.
use std::net::{Shutdown, SocketAddr, TcpStream};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use super::{Connection, TransportError, server::ServerContext};

#[derive(Debug, Default)]
pub struct SocketLink {
    socket: Option<TcpStream>,
    next: Option<Box<SocketLink>>,
}

impl SocketLink {
    pub fn new(socket: TcpStream) -> Box<Self> {
        Box::new(Self {
            socket: Some(socket),
            next: None,
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref()?.peer_addr().ok()
    }

    /// Starts a server connection over the socket and returns the rest of the list.
    pub(crate) fn start(
        mut self: Box<Self>,
        context: &ServerContext,
    ) -> (Result<Connection, TransportError>, Option<Box<SocketLink>>) {
        let next = self.next.take();
        let connection = match self.socket.take() {
            Some(socket) => Connection::start_server(socket, context),
            None => Err(TransportError::Disposed),
        };
        (connection, next)
    }

    /// Closes the socket without starting it and returns the rest of the list.
    pub fn cancel(mut self: Box<Self>) -> Option<Box<SocketLink>> {
        let next = self.next.take();
        if let Some(socket) = self.socket.take() {
            if let Err(e) = socket.shutdown(Shutdown::Both) {
                trace!("cancelled socket shutdown: {e}");
            }
        }
        next
    }
}

impl Drop for SocketLink {
    fn drop(&mut self) {
        // Unlink iteratively; a long batch would otherwise recurse once per node.
        let mut next = self.next.take();
        while let Some(mut link) = next {
            next = link.next.take();
        }
    }
}

/// Head of the list of accepted sockets, shared by the accept loop and shutdown.
#[derive(Debug, Default)]
pub struct SocketLinks {
    head: Mutex<Option<Box<SocketLink>>>,
}

impl SocketLinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, mut link: Box<SocketLink>) {
        let mut head = self.head.lock();
        link.next = head.take();
        *head = Some(link);
    }

    /// Detaches the whole list, oldest socket first.
    pub fn take(&self) -> Option<Box<SocketLink>> {
        let mut newest = self.head.lock().take();
        let mut oldest = None;
        while let Some(mut link) = newest {
            newest = link.next.take();
            link.next = oldest;
            oldest = Some(link);
        }
        oldest
    }

    pub fn is_empty(&self) -> bool {
        self.head.lock().is_none()
    }

    /// Starts every recorded socket. Sockets that fail to start are logged and dropped.
    pub(crate) fn start_all(&self, context: &ServerContext) -> Vec<Connection> {
        let mut started = Vec::new();
        let mut next = self.take();
        while let Some(link) = next {
            let peer = link.peer_addr();
            let (connection, rest) = link.start(context);
            match connection {
                Ok(connection) => started.push(connection),
                Err(e) => warn!("failed to start connection from {peer:?}: {e}"),
            }
            next = rest;
        }
        started
    }

    /// Closes every recorded socket without starting it. Returns how many were closed.
    pub fn cancel_all(&self) -> usize {
        let mut cancelled = 0;
        let mut next = self.take();
        while let Some(link) = next {
            next = link.cancel();
            cancelled += 1;
        }
        if cancelled > 0 {
            debug!("cancelled {cancelled} accepted sockets");
        }
        cancelled
    }
}
