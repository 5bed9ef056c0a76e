//! Linux socketcan transport
//!
//! One blocking `socketcan` socket is wrapped in a tokio `AsyncFd` and shared
//! by a sender half and a receiver half, so the receiver does not see frames
//! sent by the sender. The shared socket speaks [`CanMessage`] directly:
//! frame conversion, identifier validation, and retry of interrupted reads
//! all live behind its two-method surface.

use std::sync::Arc;

use crate::{
    messages::{CanError, CanId, CanMessage},
    traits::{AsyncCanReceiver, AsyncCanSender, CanSendError},
};
use snafu::Snafu;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, ShouldRetry, Socket};
use tokio::io::{unix::AsyncFd, Interest};

/// Errors raised by the socketcan receive path
#[derive(Debug, Snafu)]
pub enum TransportError {
    /// An I/O error on the underlying socket
    #[snafu(display("socket I/O error: {source}"))]
    Io {
        /// The underlying error
        source: std::io::Error,
    },
    /// The controller reported a bus error frame
    #[snafu(display("{source}"))]
    Bus {
        /// The reported bus error
        source: CanError,
    },
}

/// Validate and convert an identifier for the bus
///
/// `None` for identifiers outside the 11-bit (standard) or 29-bit (extended)
/// range, which this crate's `CanId` enum can technically hold.
fn id_to_socketcan(id: CanId) -> Option<socketcan::CanId> {
    match id {
        CanId::Std(raw) => socketcan::StandardId::new(raw).map(Into::into),
        CanId::Extended(raw) => socketcan::ExtendedId::new(raw).map(Into::into),
    }
}

fn id_from_socketcan(id: socketcan::CanId) -> CanId {
    match id {
        socketcan::CanId::Standard(id) => CanId::std(id.as_raw()),
        socketcan::CanId::Extended(id) => CanId::extended(id.as_raw()),
    }
}

fn frame_to_message(frame: CanFrame) -> Result<CanMessage, CanError> {
    let id = id_from_socketcan(frame.can_id());
    match frame {
        CanFrame::Data(f) => Ok(CanMessage::new(id, f.data())),
        CanFrame::Remote(f) => Ok(CanMessage::new_rtr(id, f.dlc() as u8)),
        CanFrame::Error(f) => Err(CanError::from_raw(f.error_bits() as u8)),
    }
}

/// `None` when the identifier does not fit the bus
fn message_to_frame(msg: CanMessage) -> Option<CanFrame> {
    let id = id_to_socketcan(msg.id())?;
    if msg.is_rtr() {
        CanFrame::new_remote(id, msg.dlc() as usize)
    } else {
        CanFrame::new(id, msg.data())
    }
}

/// The nonblocking socket behind both transport halves
#[derive(Debug)]
struct SharedSocket(AsyncFd<CanSocket>);

impl SharedSocket {
    fn open(ifname: &str) -> Result<Self, std::io::Error> {
        let socket = CanSocket::open(ifname)?;
        socket.set_nonblocking(true)?;
        Ok(Self(AsyncFd::new(socket)?))
    }

    /// Receive one message, waiting for the socket to become readable
    ///
    /// Interrupted reads are retried here; an error return means the socket
    /// is genuinely broken or the controller reported a bus error.
    async fn recv_msg(&self) -> Result<CanMessage, TransportError> {
        loop {
            let frame = match self
                .0
                .async_io(Interest::READABLE, |socket| socket.read_frame())
                .await
            {
                Ok(frame) => frame,
                Err(e) if e.should_retry() => continue,
                Err(source) => return Err(TransportError::Io { source }),
            };
            return frame_to_message(frame).map_err(|source| TransportError::Bus { source });
        }
    }

    /// Receive one message if the socket has one queued
    fn try_recv_msg(&self) -> Option<CanMessage> {
        let frame = self.0.get_ref().read_frame().ok()?;
        frame_to_message(frame).ok()
    }

    /// Write one message, waiting for the socket to become writable
    async fn send_msg(&self, msg: CanMessage) -> Result<(), SocketSendError> {
        let Some(frame) = message_to_frame(msg) else {
            return Err(SocketSendError {
                msg,
                reason: "identifier out of range for the bus".into(),
            });
        };
        self.0
            .async_io(Interest::WRITABLE, |socket| socket.write_frame(&frame))
            .await
            .map_err(|e| SocketSendError {
                msg,
                reason: e.to_string(),
            })
    }
}

/// The receiving half of a socketcan transport
#[derive(Debug, Clone)]
pub struct SocketCanReceiver {
    socket: Arc<SharedSocket>,
}

impl AsyncCanReceiver for SocketCanReceiver {
    type Error = TransportError;

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.socket.try_recv_msg()
    }

    async fn recv(&mut self) -> Result<CanMessage, TransportError> {
        self.socket.recv_msg().await
    }
}

/// Error returned when a frame could not be written to the socket
#[derive(Debug)]
pub struct SocketSendError {
    msg: CanMessage,
    reason: String,
}

impl CanSendError for SocketSendError {
    fn into_can_message(self) -> CanMessage {
        self.msg
    }

    fn message(&self) -> String {
        self.reason.clone()
    }
}

/// The sending half of a socketcan transport
#[derive(Debug, Clone)]
pub struct SocketCanSender {
    socket: Arc<SharedSocket>,
}

impl AsyncCanSender for SocketCanSender {
    type Error = SocketSendError;

    async fn send(&mut self, msg: CanMessage) -> Result<(), SocketSendError> {
        self.socket.send_msg(msg).await
    }
}

/// Open a socketcan device and split it into a sender and a receiver
///
/// # Arguments
/// * `device` - The name of the socketcan device to open, e.g. "vcan0" or "can0"
///
/// The interface bitrate is an OS-level property of the device and is
/// configured outside this library (e.g. `ip link set can0 type can bitrate
/// 500000`).
pub fn open_socketcan<S: AsRef<str>>(
    device: S,
) -> Result<(SocketCanSender, SocketCanReceiver), std::io::Error> {
    let socket = Arc::new(SharedSocket::open(device.as_ref())?);
    let receiver = SocketCanReceiver {
        socket: socket.clone(),
    };
    let sender = SocketCanSender { socket };
    Ok((sender, receiver))
}
