use std::sync::Arc;
use std::time::Duration;

use rtmp_streams::{Server, ServerError, State};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(3);

async fn bound() -> Server {
    Server::bind("127.0.0.1:0").await.unwrap()
}

fn spawn_accept(server: &Arc<Server>) -> JoinHandle<()> {
    let server = Arc::clone(server);
    tokio::spawn(async move { server.accept().await })
}

async fn wait_for(server: &Server, state: State) {
    timeout(WAIT, async {
        while server.state() != state {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("server never reached {:?}", state));
}

#[tokio::test]
async fn binds_to_an_ephemeral_port() {
    let server = bound().await;
    let addr = server.local_addr().unwrap();

    assert!(addr.ip().is_loopback());
    assert_ne!(addr.port(), 0);
    assert_eq!(server.state(), State::Idle);
}

#[tokio::test]
async fn bind_reports_unresolvable_addresses() {
    let err = Server::bind("127.0.0.1:99999").await.err().unwrap();
    assert!(matches!(err, ServerError::Resolve { .. }));
}

#[tokio::test]
async fn bind_reports_ports_in_use() {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = taken.local_addr().unwrap().to_string();

    let err = Server::bind(&addr).await.err().unwrap();
    assert!(matches!(err, ServerError::Bind { .. }));
}

#[tokio::test]
async fn wraps_an_existing_listener() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = Server::from_listener(listener);
    assert_eq!(server.local_addr(), Some(addr));
    assert_eq!(server.state(), State::Idle);
}

#[tokio::test]
async fn accepted_clients_arrive_on_the_feed() {
    let mut server = bound().await;
    let addr = server.local_addr().unwrap();
    let mut clients = server.clients().unwrap();
    assert!(server.clients().is_none());

    let server = Arc::new(server);
    let accept = spawn_accept(&server);

    let dialer = TcpStream::connect(addr).await.unwrap();
    let client = timeout(WAIT, clients.recv()).await.unwrap().unwrap();
    assert_eq!(client.addr(), dialer.local_addr().unwrap());
    assert!(client.stream().nodelay().unwrap());

    server.close().await;
    timeout(WAIT, accept).await.unwrap().unwrap();
}

#[tokio::test]
async fn close_stops_accepting_and_closes_the_feeds() {
    let mut server = bound().await;
    let addr = server.local_addr().unwrap();
    let mut clients = server.clients().unwrap();
    let mut errs = server.errs().unwrap();

    let server = Arc::new(server);
    let accept = spawn_accept(&server);
    wait_for(&server, State::Accepting).await;

    timeout(WAIT, server.close()).await.unwrap();
    timeout(WAIT, accept).await.unwrap().unwrap();

    assert_eq!(server.state(), State::Closed);
    assert!(timeout(WAIT, clients.recv()).await.unwrap().is_none());
    assert!(timeout(WAIT, errs.recv()).await.unwrap().is_none());
    assert!(TcpStream::connect(addr).await.is_err());

    // Closing again is a no-op.
    timeout(WAIT, server.close()).await.unwrap();
    assert!(server.release().await.is_none());
}

#[tokio::test]
async fn only_one_accept_loop_runs() {
    let server = Arc::new(bound().await);
    let first = spawn_accept(&server);
    wait_for(&server, State::Accepting).await;

    timeout(WAIT, server.accept()).await.unwrap();
    assert_eq!(server.state(), State::Accepting);

    server.close().await;
    timeout(WAIT, first).await.unwrap().unwrap();
}

#[tokio::test]
async fn release_hands_back_a_working_listener() {
    let mut server = bound().await;
    let addr = server.local_addr().unwrap();
    let mut clients = server.clients().unwrap();

    let server = Arc::new(server);
    let accept = spawn_accept(&server);
    wait_for(&server, State::Accepting).await;

    let listener = timeout(WAIT, server.release()).await.unwrap().unwrap();
    timeout(WAIT, accept).await.unwrap().unwrap();
    assert_eq!(server.state(), State::Closed);
    assert_eq!(listener.local_addr().unwrap(), addr);
    assert!(timeout(WAIT, clients.recv()).await.unwrap().is_none());

    // The socket stayed open, so the new owner can keep accepting on it.
    let dialer = TcpStream::connect(addr).await.unwrap();
    let (_, peer) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    assert_eq!(peer, dialer.local_addr().unwrap());

    assert!(server.release().await.is_none());
}

#[tokio::test]
async fn idle_servers_shut_down_without_accepting() {
    let server = bound().await;
    timeout(WAIT, server.close()).await.unwrap();
    assert_eq!(server.state(), State::Closed);

    // A later accept never starts.
    timeout(WAIT, server.accept()).await.unwrap();
    assert_eq!(server.state(), State::Closed);

    let server = bound().await;
    let addr = server.local_addr().unwrap();
    let listener = timeout(WAIT, server.release()).await.unwrap().unwrap();
    assert_eq!(server.state(), State::Closed);
    assert_eq!(listener.local_addr().unwrap(), addr);
}

#[tokio::test]
async fn close_does_not_hang_on_undrained_feeds() {
    let mut server = bound().await;
    let addr = server.local_addr().unwrap();
    // Held but never read.
    let _clients = server.clients().unwrap();

    let server = Arc::new(server);
    let accept = spawn_accept(&server);
    wait_for(&server, State::Accepting).await;

    let mut dialers = Vec::new();
    for _ in 0..3 {
        dialers.push(TcpStream::connect(addr).await.unwrap());
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    timeout(WAIT, server.close()).await.unwrap();
    timeout(WAIT, accept).await.unwrap().unwrap();
    assert_eq!(server.state(), State::Closed);
}
