use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{lookup_host, TcpListener};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::server::client::Client;
use crate::server::error::{
    classify, deadline_exceeded, listener_closed, AcceptFailure, Disposition, ServerError,
};

/// Longest a shutdown waits for a consumer to take a pending client or error.
const DEFAULT_DEADLINE: Duration = Duration::from_secs(1);

/// Clients and errors are handed over one at a time; unread clients are
/// never queued up inside the server.
const FEED_CAPACITY: usize = 1;

/// Lifecycle of a [`Server`].
///
/// ```text
///               +-----------+
///               |   IDLE    |
///               +-----------+
///                     | accept()
///                     v
///               +-----------+
///               | ACCEPTING |
///               +-----------+
///          close() |     | release()
///                  v     v
///     +-----------+       +-----------+
///     |  CLOSING  |       | RELEASING |
///     +-----------+       +-----------+
///                  |     |
///                  v     v
///               +-----------+
///               |  CLOSED   |
///               +-----------+
/// ```
///
/// Closing or releasing an idle server goes straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Accepting,
    Closing,
    Releasing,
    Closed,
}

#[derive(Debug, Clone, Copy)]
struct Status {
    state: State,
    /// Armed by `release()`; the pending accept gives up once it passes.
    deadline: Option<Instant>,
}

/// Resources the accept loop borrows while it runs.
struct Endpoints {
    listener: Option<Arc<TcpListener>>,
    clients: Option<mpsc::Sender<Client>>,
    errs: Option<mpsc::Sender<ServerError>>,
}

/// A TCP server that accepts connections and pushes them onto a client feed.
///
/// [`accept`](Server::accept) runs the accept loop and is meant to be
/// spawned on its own task. The loop is stopped either by
/// [`close`](Server::close), which closes the listening socket, or by
/// [`release`](Server::release), which hands the still-open listener back
/// to the caller.
pub struct Server {
    status: watch::Sender<Status>,
    endpoints: Mutex<Endpoints>,
    clients: Option<mpsc::Receiver<Client>>,
    errs: Option<mpsc::Receiver<ServerError>>,
    local_addr: Option<SocketAddr>,
    deadline: Duration,
    #[cfg(test)]
    faults: std::sync::Mutex<std::collections::VecDeque<io::Error>>,
}

impl Server {
    /// Resolves `addr` and binds a listener to it.
    pub async fn bind(addr: &str) -> Result<Self, ServerError> {
        let resolved = lookup_host(addr)
            .await
            .map_err(|source| ServerError::Resolve {
                addr: addr.to_string(),
                source,
            })?
            .next()
            .ok_or_else(|| ServerError::NoAddress(addr.to_string()))?;

        let listener = TcpListener::bind(resolved)
            .await
            .map_err(|source| ServerError::Bind {
                addr: resolved,
                source,
            })?;

        Ok(Self::from_listener(listener))
    }

    /// Wraps an already bound listener.
    pub fn from_listener(listener: TcpListener) -> Self {
        let (clients_tx, clients_rx) = mpsc::channel(FEED_CAPACITY);
        let (errs_tx, errs_rx) = mpsc::channel(FEED_CAPACITY);
        let (status, _) = watch::channel(Status {
            state: State::Idle,
            deadline: None,
        });

        Self {
            status,
            local_addr: listener.local_addr().ok(),
            endpoints: Mutex::new(Endpoints {
                listener: Some(Arc::new(listener)),
                clients: Some(clients_tx),
                errs: Some(errs_tx),
            }),
            clients: Some(clients_rx),
            errs: Some(errs_rx),
            deadline: DEFAULT_DEADLINE,
            #[cfg(test)]
            faults: Default::default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Queues an error for the accept loop to see in place of its next accept.
    #[cfg(test)]
    pub(crate) fn inject_fault(&self, err: io::Error) {
        self.faults.lock().unwrap().push_back(err);
    }

    #[cfg(test)]
    fn next_fault(&self) -> Option<io::Error> {
        self.faults.lock().unwrap().pop_front()
    }

    #[cfg(not(test))]
    fn next_fault(&self) -> Option<io::Error> {
        None
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn state(&self) -> State {
        self.status.borrow().state
    }

    /// Feed of accepted clients, in acceptance order. Handed out once.
    pub fn clients(&mut self) -> Option<mpsc::Receiver<Client>> {
        self.clients.take()
    }

    /// Feed of accept errors. A fatal error, if any, is the last item. Handed out once.
    pub fn errs(&mut self) -> Option<mpsc::Receiver<ServerError>> {
        self.errs.take()
    }

    /// Runs the accept loop until the server is closed, released, or hits a
    /// fatal error.
    ///
    /// Returns immediately unless the server is idle, so at most one loop
    /// ever runs per server.
    pub async fn accept(&self) {
        let started = self.status.send_if_modified(|status| {
            if status.state != State::Idle {
                return false;
            }
            status.state = State::Accepting;
            true
        });
        if !started {
            debug!("Accept loop not started, server is {:?}", self.state());
            return;
        }
        // Declared first so it runs last, after the listener and feeds are dropped.
        let _closed = CloseOnExit(&self.status);

        let (listener, clients, errs) = {
            let mut endpoints = self.endpoints.lock().await;
            (
                endpoints.listener.clone(),
                endpoints.clients.take(),
                endpoints.errs.take(),
            )
        };
        let (Some(listener), Some(clients), Some(errs)) = (listener, clients, errs) else {
            warn!("Server endpoints already gone, not accepting");
            return;
        };

        info!("Accepting connections on {:?}", self.local_addr);
        self.accept_loop(&listener, &clients, &errs).await;
        info!("Stopped accepting connections on {:?}", self.local_addr);
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        clients: &mpsc::Sender<Client>,
        errs: &mpsc::Sender<ServerError>,
    ) {
        let mut status = self.status.subscribe();

        loop {
            let accepted = match self.next_fault() {
                Some(fault) => Err(AcceptFailure::Network(fault)),
                None => tokio::select! {
                    biased;
                    interrupt = interrupted(&mut status) => Err(AcceptFailure::Network(interrupt)),
                    accepted = listener.accept() => accepted.map_err(AcceptFailure::Network),
                },
            };

            let failure = match accepted.and_then(|(stream, addr)| {
                Client::new(stream, addr).map_err(AcceptFailure::Client)
            }) {
                Ok(client) => {
                    debug!("New connection from {}", client.addr());
                    self.deliver(clients, client, &mut status).await;
                    continue;
                }
                Err(failure) => failure,
            };

            // Classified under the state lock so a concurrent close or
            // release cannot change state between the read and the verdict.
            let disposition = {
                let current = self.status.borrow();
                classify(current.state, failure)
            };

            match disposition {
                Disposition::Terminate => {
                    debug!("Accept loop interrupted by shutdown");
                    return;
                }
                Disposition::Report(e) => {
                    warn!("Accept error: {}", e);
                    self.deliver(errs, e, &mut status).await;
                }
                Disposition::Fatal(e) => {
                    error!("Fatal accept error: {}", e);
                    self.deliver(errs, e, &mut status).await;
                    return;
                }
            }
        }
    }

    /// Hands `item` to a feed's consumer. Once a shutdown is under way the
    /// consumer gets at most `deadline` to take it before it is dropped.
    async fn deliver<T>(
        &self,
        feed: &mpsc::Sender<T>,
        item: T,
        status: &mut watch::Receiver<Status>,
    ) {
        let permit = tokio::select! {
            biased;
            permit = feed.reserve() => permit,
            _ = shutdown_requested(status) => {
                match tokio::time::timeout(self.deadline, feed.reserve()).await {
                    Ok(permit) => permit,
                    Err(_) => {
                        warn!("Feed not drained within {:?} of shutdown, dropping item", self.deadline);
                        return;
                    }
                }
            }
        };

        match permit {
            Ok(permit) => permit.send(item),
            Err(_) => debug!("Feed receiver dropped, discarding item"),
        }
    }

    /// Closes the listening socket and waits for the accept loop to stop.
    ///
    /// Idempotent. The client and error feeds are closed when this returns.
    pub async fn close(&self) {
        self.status.send_if_modified(|status| match status.state {
            State::Idle => {
                status.state = State::Closed;
                true
            }
            State::Accepting => {
                status.state = State::Closing;
                true
            }
            _ => false,
        });
        self.wait_for_closed().await;

        let mut endpoints = self.endpoints.lock().await;
        endpoints.clients.take();
        endpoints.errs.take();
        if endpoints.listener.take().is_some() {
            info!("Server on {:?} closed", self.local_addr);
        }
    }

    /// Stops the accept loop without closing the socket and returns the
    /// listener so another owner can keep accepting on it.
    ///
    /// Idempotent; only the first call (or a call racing a close) that finds
    /// the listener gets it back, later ones return `None`.
    pub async fn release(&self) -> Option<TcpListener> {
        self.status.send_if_modified(|status| match status.state {
            State::Idle => {
                status.state = State::Closed;
                true
            }
            State::Accepting => {
                status.state = State::Releasing;
                status.deadline = Some(Instant::now());
                true
            }
            _ => false,
        });
        self.wait_for_closed().await;

        let mut endpoints = self.endpoints.lock().await;
        endpoints.clients.take();
        endpoints.errs.take();
        match Arc::try_unwrap(endpoints.listener.take()?) {
            Ok(listener) => {
                info!("Released listener on {:?}", self.local_addr);
                Some(listener)
            }
            Err(_) => {
                warn!("Listener is still in use, cannot release it");
                None
            }
        }
    }

    async fn wait_for_closed(&self) {
        let mut status = self.status.subscribe();
        loop {
            if status.borrow_and_update().state == State::Closed {
                return;
            }
            if status.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Moves the server to `Closed` when the accept loop exits by any path.
struct CloseOnExit<'a>(&'a watch::Sender<Status>);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.send_modify(|status| {
            status.state = State::Closed;
            status.deadline = None;
        });
    }
}

/// Resolves with the error a pending accept should fail with once a close
/// or release interrupts it.
async fn interrupted(status: &mut watch::Receiver<Status>) -> io::Error {
    loop {
        let current = *status.borrow_and_update();
        if current.state == State::Closing {
            return listener_closed();
        }

        match current.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => return deadline_exceeded(),
                    changed = status.changed() => {
                        if changed.is_err() {
                            return listener_closed();
                        }
                    }
                }
            }
            None => {
                if status.changed().await.is_err() {
                    return listener_closed();
                }
            }
        }
    }
}

async fn shutdown_requested(status: &mut watch::Receiver<Status>) {
    loop {
        if status.borrow_and_update().state != State::Accepting {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(3);

    async fn accepting(server: &Server) {
        timeout(WAIT, async {
            while server.state() != State::Accepting {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("accept loop never started");
    }

    #[tokio::test]
    async fn close_gives_up_on_an_unread_client_after_the_deadline() {
        let mut server = Server::bind("127.0.0.1:0")
            .await
            .unwrap()
            .with_deadline(Duration::from_millis(50));
        let addr = server.local_addr().unwrap();
        let _clients = server.clients().unwrap();
        let server = Arc::new(server);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.accept().await }
        });
        accepting(&server).await;

        // The first client fills the feed, the second one has nowhere to go.
        let _first = TcpStream::connect(addr).await.unwrap();
        let _second = TcpStream::connect(addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(WAIT, server.close()).await.unwrap();
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(server.state(), State::Closed);
    }

    #[tokio::test]
    async fn temporary_errors_are_reported_and_accepting_continues() {
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let mut clients = server.clients().unwrap();
        let mut errs = server.errs().unwrap();
        server.inject_fault(io::ErrorKind::ConnectionAborted.into());
        server.inject_fault(io::ErrorKind::ConnectionReset.into());

        let server = Arc::new(server);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.accept().await }
        });

        for _ in 0..2 {
            let err = timeout(WAIT, errs.recv()).await.unwrap().unwrap();
            assert!(matches!(err, ServerError::Accept(_)));
            assert!(!err.is_fatal());
        }

        let dialer = TcpStream::connect(addr).await.unwrap();
        let client = timeout(WAIT, clients.recv()).await.unwrap().unwrap();
        assert_eq!(client.addr(), dialer.local_addr().unwrap());
        assert_eq!(server.state(), State::Accepting);

        server.close().await;
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(errs.recv().await.is_none());
    }

    #[tokio::test]
    async fn fatal_error_is_the_last_report_and_stops_the_loop() {
        let mut server = Server::bind("127.0.0.1:0").await.unwrap();
        let mut clients = server.clients().unwrap();
        let mut errs = server.errs().unwrap();
        server.inject_fault(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));

        let server = Arc::new(server);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.accept().await }
        });

        let err = timeout(WAIT, errs.recv()).await.unwrap().unwrap();
        assert!(err.is_fatal());
        assert!(timeout(WAIT, errs.recv()).await.unwrap().is_none());
        assert!(timeout(WAIT, clients.recv()).await.unwrap().is_none());

        // The loop ended by itself; nobody called close or release.
        timeout(WAIT, task).await.unwrap().unwrap();
        assert_eq!(server.state(), State::Closed);
    }

    #[tokio::test]
    async fn release_clears_the_deadline() {
        let server = Arc::new(Server::bind("127.0.0.1:0").await.unwrap());
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.accept().await }
        });
        accepting(&server).await;

        assert!(timeout(WAIT, server.release()).await.unwrap().is_some());
        timeout(WAIT, task).await.unwrap().unwrap();
        assert!(server.status.borrow().deadline.is_none());
    }
}
