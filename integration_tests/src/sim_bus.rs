//! An in-process CAN bus
//!
//! Every frame sent by one endpoint is delivered to every other endpoint, but
//! never echoed back to its sender, matching the behavior of a split
//! socketcan socket. Tests attach the master stack on one endpoint and
//! scripted peers or frame taps on others.

use std::sync::{Arc, Mutex};

use canmaster_common::messages::CanMessage;
use canmaster_common::traits::{AsyncCanReceiver, AsyncCanSender, CanSendError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

#[derive(Default)]
struct BusInner {
    listeners: Vec<(usize, UnboundedSender<CanMessage>)>,
    next_endpoint: usize,
}

/// A simulated bus frames can be sent on and received from
#[derive(Clone, Default)]
pub struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint: a sender and a receiver sharing an identity
    ///
    /// The receiver hears everything except frames sent by its own sender.
    pub fn endpoint(&self) -> (SimBusSender, SimBusReceiver) {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_endpoint;
        inner.next_endpoint += 1;
        let (tx, rx) = unbounded_channel();
        inner.listeners.push((id, tx));
        (
            SimBusSender {
                id,
                inner: self.inner.clone(),
            },
            SimBusReceiver { channel_rx: rx },
        )
    }
}

/// The sending half of a bus endpoint
#[derive(Clone)]
pub struct SimBusSender {
    id: usize,
    inner: Arc<Mutex<BusInner>>,
}

impl SimBusSender {
    /// Synchronous send, for scripted peers driven outside the traits
    pub fn send_now(&self, msg: CanMessage) {
        let mut inner = self.inner.lock().unwrap();
        inner.listeners.retain(|(_, tx)| !tx.is_closed());
        for (id, tx) in inner.listeners.iter() {
            if *id != self.id {
                tx.send(msg).ok();
            }
        }
    }
}

/// Error type for the sim bus sender
///
/// The sender cannot fail, so this is never instantiated.
#[derive(Debug)]
pub struct SimBusSendError(());

impl CanSendError for SimBusSendError {
    fn into_can_message(self) -> CanMessage {
        unreachable!("sim bus sends cannot fail")
    }

    fn message(&self) -> String {
        String::new()
    }
}

impl AsyncCanSender for SimBusSender {
    type Error = SimBusSendError;

    async fn send(&mut self, msg: CanMessage) -> Result<(), SimBusSendError> {
        self.send_now(msg);
        Ok(())
    }
}

/// The receiving half of a bus endpoint
pub struct SimBusReceiver {
    channel_rx: UnboundedReceiver<CanMessage>,
}

impl AsyncCanReceiver for SimBusReceiver {
    type Error = ();

    async fn recv(&mut self) -> Result<CanMessage, Self::Error> {
        self.channel_rx.recv().await.ok_or(())
    }

    fn try_recv(&mut self) -> Option<CanMessage> {
        self.channel_rx.try_recv().ok()
    }
}

impl SimBusReceiver {
    /// Collect every frame arriving within the window
    pub async fn collect_for(
        &mut self,
        window: std::time::Duration,
    ) -> Vec<(std::time::Instant, CanMessage)> {
        let mut frames = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(msg)) = tokio::time::timeout_at(deadline, self.channel_rx.recv()).await {
            frames.push((std::time::Instant::now(), msg));
        }
        frames
    }

    /// Wait for the next frame, panicking after a second of silence
    pub async fn expect_frame(&mut self) -> CanMessage {
        tokio::time::timeout(std::time::Duration::from_secs(1), self.channel_rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("bus closed")
    }

    /// Wait for the next frame with the given identifier, skipping others
    pub async fn expect_frame_on(&mut self, id: canmaster_common::CanId) -> CanMessage {
        loop {
            let msg = self.expect_frame().await;
            if msg.id() == id {
                return msg;
            }
        }
    }
}
