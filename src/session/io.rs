use anyhow::Result;
use async_trait::async_trait;
use futures::SinkExt;
use std::net::SocketAddr;
use std::sync::Mutex as StdMutex;
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::bgp;

/// Outcome of a NOTIFICATION write attempt (§4.5 step 4): the send-protocol
/// decides whether to raise `Sent_NOTIFICATION` immediately or arm the
/// courtesy/Stopping HoldTimer and wait for drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Flushed,
    Queued,
    Failed,
}

/// Soft vs hard I/O error classification (§6). Soft errors on an
/// established read surface as `TCP_connection_closed`; soft errors while
/// connecting surface the same way to the `failed` action. Anything else
/// is `TCP_fatal_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoErrorClass {
    SoftClose,
    SoftConnectFailure,
    Hard,
}

pub fn classify_io_error(err: &std::io::Error, connecting: bool) -> IoErrorClass {
    use std::io::ErrorKind::*;
    if connecting {
        match err.kind() {
            ConnectionRefused | ConnectionReset | TimedOut => IoErrorClass::SoftConnectFailure,
            _ if err.raw_os_error() == Some(libc_ehostunreach()) => {
                IoErrorClass::SoftConnectFailure
            }
            _ => IoErrorClass::Hard,
        }
    } else {
        match err.kind() {
            ConnectionReset | BrokenPipe | TimedOut | UnexpectedEof => IoErrorClass::SoftClose,
            _ if err.raw_os_error() == Some(libc_enetdown())
                || err.raw_os_error() == Some(libc_enetunreach()) =>
            {
                IoErrorClass::SoftClose
            }
            _ => IoErrorClass::Hard,
        }
    }
}

// Named indirections rather than a `libc` dependency: this crate has no
// other use for `libc`, so these match the handful of errno values the
// spec names (§6) without carrying the whole crate.
fn libc_ehostunreach() -> i32 {
    113
}
fn libc_enetdown() -> i32 {
    100
}
fn libc_enetunreach() -> i32 {
    101
}

/// The southbound contract a `Connection` drives I/O through. Actions call
/// these; completions come back as events raised on the Connection's
/// channel (the I/O surface owns no FSM policy, §2).
#[async_trait]
pub trait ConnectionIo: Send + Sync {
    async fn connect(&self, remote: SocketAddr) -> Result<(), std::io::Error>;
    async fn enable_read(&self);
    async fn disable_read(&self);
    async fn write_open(&self, msg: bgp::BGPOpenMessage) -> Result<(), std::io::Error>;
    async fn write_keepalive(&self) -> Result<(), std::io::Error>;
    async fn write_notification(
        &self,
        msg: bgp::BGPNotificationMessage,
    ) -> Result<WriteOutcome, std::io::Error>;
    async fn close(&self);
}

/// Real `ConnectionIo` over a framed TCP stream, grounded in the same
/// `Framed<TcpStream, BGPMessageCodec>` + `SinkExt::send` shape the
/// teacher's `neighbor::connection` module uses.
pub struct TcpIoDriver {
    framed: StdMutex<Option<Framed<TcpStream, bgp::BGPMessageCodec>>>,
    reading_enabled: StdMutex<bool>,
}

impl TcpIoDriver {
    pub fn new(stream: TcpStream) -> Self {
        TcpIoDriver {
            framed: StdMutex::new(Some(Framed::new(stream, bgp::BGPMessageCodec))),
            reading_enabled: StdMutex::new(true),
        }
    }

    fn take_frame_guard(&self) -> std::sync::MutexGuard<'_, Option<Framed<TcpStream, bgp::BGPMessageCodec>>> {
        self.framed.lock().unwrap()
    }

    /// Reads the next wire message, honouring `disable_read`. Used by the
    /// per-Connection read loop to turn bytes into `Receive_*` events.
    pub async fn read_next(&self) -> Option<Result<bgp::Message, std::io::Error>> {
        if !*self.reading_enabled.lock().unwrap() {
            return None;
        }
        let mut guard = self.take_frame_guard();
        match guard.as_mut() {
            Some(framed) => framed.next().await.map(|r| r.map(bgp::Message::from)),
            None => None,
        }
    }
}

#[async_trait]
impl ConnectionIo for TcpIoDriver {
    async fn connect(&self, _remote: SocketAddr) -> Result<(), std::io::Error> {
        // The socket for the primary leg is established by the caller
        // (the outbound-connect task) before a TcpIoDriver is constructed;
        // this surface only frames and drives an already-open stream.
        Ok(())
    }

    async fn enable_read(&self) {
        *self.reading_enabled.lock().unwrap() = true;
    }

    async fn disable_read(&self) {
        *self.reading_enabled.lock().unwrap() = false;
    }

    async fn write_open(&self, msg: bgp::BGPOpenMessage) -> Result<(), std::io::Error> {
        let message: Vec<u8> =
            bgp::Message::new(bgp::MessageType::Open, bgp::BGPMessageBody::Open(msg))
                .expect("open message always builds")
                .into();
        let mut guard = self.take_frame_guard();
        match guard.as_mut() {
            Some(framed) => framed
                .send(message)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    async fn write_keepalive(&self) -> Result<(), std::io::Error> {
        let body = bgp::BGPKeepaliveMessage::new().expect("keepalive always builds");
        let message: Vec<u8> = bgp::Message::new(
            bgp::MessageType::Keepalive,
            bgp::BGPMessageBody::Keepalive(body),
        )
        .expect("keepalive message always builds")
        .into();
        let mut guard = self.take_frame_guard();
        match guard.as_mut() {
            Some(framed) => framed
                .send(message)
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection closed",
            )),
        }
    }

    async fn write_notification(
        &self,
        msg: bgp::BGPNotificationMessage,
    ) -> Result<WriteOutcome, std::io::Error> {
        let message: Vec<u8> = bgp::Message::new(
            bgp::MessageType::Notification,
            bgp::BGPMessageBody::Notification(msg),
        )
        .expect("notification message always builds")
        .into();
        let mut guard = self.take_frame_guard();
        match guard.as_mut() {
            Some(framed) => match framed.send(message).await {
                Ok(()) => Ok(WriteOutcome::Flushed),
                Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e)),
            },
            None => Ok(WriteOutcome::Failed),
        }
    }

    async fn close(&self) {
        *self.take_frame_guard() = None;
    }
}

#[cfg(test)]
pub use mock::{IoCall, MockIo};

#[cfg(test)]
mod mock {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Debug, Clone, PartialEq)]
    pub enum IoCall {
        Connect(SocketAddr),
        EnableRead,
        DisableRead,
        WriteOpen(bgp::BGPOpenMessage),
        WriteKeepalive,
        WriteNotification(bgp::BGPNotificationMessage),
        Close,
    }

    /// Records every call for assertion in FSM unit tests. `next_connect`
    /// and `next_write_outcome` let a test script a specific I/O
    /// completion without a real socket.
    #[derive(Default)]
    pub struct MockIo {
        pub calls: TokioMutex<Vec<IoCall>>,
        pub connect_result: TokioMutex<Option<std::io::Error>>,
        pub write_outcome: TokioMutex<Option<WriteOutcome>>,
    }

    impl MockIo {
        pub fn new() -> Self {
            MockIo::default()
        }

        pub async fn calls(&self) -> Vec<IoCall> {
            self.calls.lock().await.clone()
        }
    }

    #[async_trait]
    impl ConnectionIo for MockIo {
        async fn connect(&self, remote: SocketAddr) -> Result<(), std::io::Error> {
            self.calls.lock().await.push(IoCall::Connect(remote));
            match self.connect_result.lock().await.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn enable_read(&self) {
            self.calls.lock().await.push(IoCall::EnableRead);
        }

        async fn disable_read(&self) {
            self.calls.lock().await.push(IoCall::DisableRead);
        }

        async fn write_open(&self, msg: bgp::BGPOpenMessage) -> Result<(), std::io::Error> {
            self.calls.lock().await.push(IoCall::WriteOpen(msg));
            Ok(())
        }

        async fn write_keepalive(&self) -> Result<(), std::io::Error> {
            self.calls.lock().await.push(IoCall::WriteKeepalive);
            Ok(())
        }

        async fn write_notification(
            &self,
            msg: bgp::BGPNotificationMessage,
        ) -> Result<WriteOutcome, std::io::Error> {
            self.calls
                .lock()
                .await
                .push(IoCall::WriteNotification(msg));
            Ok(self
                .write_outcome
                .lock()
                .await
                .unwrap_or(WriteOutcome::Flushed))
        }

        async fn close(&self) {
            self.calls.lock().await.push(IoCall::Close);
        }
    }
}
