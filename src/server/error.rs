use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::server::listener::State;
use crate::utils::error::RtmpError;

/// Errors surfaced by a [`Server`](crate::server::listener::Server), either
/// from construction or on its error feed.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to resolve {addr}: {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("no address found for {0}")]
    NoAddress(String),

    #[error("bind failed on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("accept loop stopped: {0}")]
    Fatal(#[source] io::Error),

    #[error("failed to set up client: {0}")]
    Client(#[source] RtmpError),
}

impl ServerError {
    /// True when the server has stopped accepting and will not recover on its own.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ServerError::Fatal(_))
    }
}

/// Marks an accept that was cut short because the server is closing.
#[derive(Debug, Error)]
#[error("use of closed network listener")]
pub(crate) struct ListenerClosed;

pub(crate) fn listener_closed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, ListenerClosed)
}

pub(crate) fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "accept deadline exceeded")
}

/// Why one turn of the accept loop did not produce a client.
#[derive(Debug)]
pub(crate) enum AcceptFailure {
    Network(io::Error),
    Client(RtmpError),
}

/// What the accept loop does about an [`AcceptFailure`].
#[derive(Debug)]
pub(crate) enum Disposition {
    /// Report on the error feed and keep accepting.
    Report(ServerError),
    /// Expected end of a close or release; nothing is reported.
    Terminate,
    /// Report on the error feed and stop accepting.
    Fatal(ServerError),
}

/// Decides how the accept loop reacts to `failure` while in `state`.
///
/// The same failure means different things depending on which shutdown is
/// in progress: a timeout ends a release, a closed listener ends a close,
/// and either one outside its shutdown is treated like any other error.
pub(crate) fn classify(state: State, failure: AcceptFailure) -> Disposition {
    let err = match failure {
        AcceptFailure::Client(e) => return Disposition::Report(ServerError::Client(e)),
        AcceptFailure::Network(err) => err,
    };

    if state == State::Releasing && err.kind() == io::ErrorKind::TimedOut {
        return Disposition::Terminate;
    }
    if state == State::Closing && is_listener_closed(&err) {
        return Disposition::Terminate;
    }
    if is_temporary(&err) {
        return Disposition::Report(ServerError::Accept(err));
    }
    Disposition::Fatal(ServerError::Fatal(err))
}

fn is_listener_closed(err: &io::Error) -> bool {
    err.get_ref().map_or(false, |inner| inner.is::<ListenerClosed>()) || is_bad_descriptor(err)
}

fn is_temporary(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || is_resource_exhaustion(err)
}

#[cfg(unix)]
fn is_bad_descriptor(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EBADF)
}

#[cfg(not(unix))]
fn is_bad_descriptor(_err: &io::Error) -> bool {
    false
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(err: io::Error) -> AcceptFailure {
        AcceptFailure::Network(err)
    }

    #[test]
    fn client_setup_failures_are_reported_and_survivable() {
        let failure = AcceptFailure::Client(RtmpError::Protocol("no".into()));
        match classify(State::Accepting, failure) {
            Disposition::Report(e) => assert!(!e.is_fatal()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn timeout_ends_a_release() {
        assert!(matches!(
            classify(State::Releasing, network(deadline_exceeded())),
            Disposition::Terminate
        ));
    }

    #[test]
    fn closed_listener_ends_a_close() {
        assert!(matches!(
            classify(State::Closing, network(listener_closed())),
            Disposition::Terminate
        ));
    }

    #[test]
    fn shutdown_signals_outside_their_shutdown_are_not_swallowed() {
        // A timeout while closing is just a temporary error.
        assert!(matches!(
            classify(State::Closing, network(deadline_exceeded())),
            Disposition::Report(ServerError::Accept(_))
        ));
        // A closed listener while releasing is unexpected.
        assert!(matches!(
            classify(State::Releasing, network(listener_closed())),
            Disposition::Fatal(_)
        ));
    }

    #[test]
    fn temporary_errors_keep_the_loop_running() {
        for kind in [io::ErrorKind::ConnectionAborted, io::ErrorKind::ConnectionReset] {
            assert!(matches!(
                classify(State::Accepting, network(kind.into())),
                Disposition::Report(_)
            ));
        }
    }

    #[cfg(unix)]
    #[test]
    fn descriptor_exhaustion_is_temporary() {
        let err = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(matches!(
            classify(State::Accepting, network(err)),
            Disposition::Report(_)
        ));
    }

    #[test]
    fn unexpected_errors_are_fatal() {
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        match classify(State::Accepting, network(err)) {
            Disposition::Fatal(e) => assert!(e.is_fatal()),
            other => panic!("unexpected {:?}", other),
        }
    }
}
