//! Transport traits consumed by the master stack
//!
//! The physical CAN driver is an external collaborator; anything that can
//! send and receive frames asynchronously can carry the stack. The
//! [`socketcan`](crate::open_socketcan) transport implements these for Linux.

use crate::messages::CanMessage;

/// An async CAN sender
pub trait AsyncCanSender: Send {
    /// Error type returned by send
    type Error: CanSendError;

    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>> + Send;
}

/// A trait for CAN send errors which may come from different interfaces
pub trait CanSendError: core::fmt::Debug + Send {
    /// Convert the error into the undelivered message
    fn into_can_message(self) -> CanMessage;

    /// Get a string describing the error
    fn message(&self) -> String;
}

/// An async CAN receiver
pub trait AsyncCanReceiver: Send {
    /// The error type returned by recv
    type Error: core::fmt::Debug + Send;

    /// Receive an available message immediately, or `None` if none is queued
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive
    ///
    /// An `Err` return means the transport is closed or broken; receivers are
    /// not expected to recover after one.
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
