//! The core dispatcher
//!
//! Owns the transport: a single receive worker classifies every inbound frame
//! by its CANopen function code and routes it to the NMT master, the SDO
//! client's pending transaction, or the PDO engine. A single transmit worker
//! drains the outbound queue so only one frame writer exists at a time.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};

use canmaster_common::{
    messages::{split_cob, FunctionCode},
    traits::{AsyncCanReceiver, AsyncCanSender},
    CanId, CanMessage,
};
use snafu::Snafu;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::nmt_master::{NmtMaster, NmtMasterConfig};
use crate::pdo::PdoEngine;
use crate::sdo_client::{SdoClient, SdoClientConfig};

/// Errors raised by the core dispatcher
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum CoreError {
    /// The core has been stopped; no more frames can be sent
    Stopped,
}

/// Configuration for [`Core`] construction
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreConfig {
    /// SDO client settings
    pub sdo: SdoClientConfig,
    /// NMT master settings
    pub nmt: NmtMasterConfig,
}

/// Shared stop flag observed by every worker and producer task
#[derive(Debug, Default)]
pub(crate) struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Resolves once the stop flag is raised
    pub async fn wait(&self) {
        while !self.is_stopped() {
            let notified = self.notify.notified();
            if self.is_stopped() {
                break;
            }
            notified.await;
        }
    }
}

type EmcyCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

pub(crate) struct HandleShared {
    tx: mpsc::UnboundedSender<CanMessage>,
    pub(crate) stop: Arc<StopSignal>,
    emcy_callbacks: Mutex<std::collections::HashMap<u8, Vec<EmcyCallback>>>,
    unknown_frames: AtomicU64,
}

/// A cheap handle to a running [`Core`]
///
/// Handles can be cloned freely; they remain valid (but refuse to send) after
/// the core is stopped.
#[derive(Clone)]
pub struct CoreHandle {
    pub(crate) shared: Arc<HandleShared>,
}

impl CoreHandle {
    /// Queue a frame for transmission
    pub fn send(&self, msg: CanMessage) -> Result<(), CoreError> {
        if self.shared.stop.is_stopped() {
            return Err(CoreError::Stopped);
        }
        self.shared.tx.send(msg).map_err(|_| CoreError::Stopped)
    }

    /// True once [`Core::stop`] has been called
    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_stopped()
    }

    /// Register a callback for emergency frames from the given node
    pub fn register_emcy_callback(&self, node: u8, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.shared
            .emcy_callbacks
            .lock()
            .unwrap()
            .entry(node)
            .or_default()
            .push(Arc::new(callback));
    }

    /// Remove all emergency callbacks registered for the given node
    pub fn clear_emcy_callbacks(&self, node: u8) {
        self.shared.emcy_callbacks.lock().unwrap().remove(&node);
    }

    /// Number of frames received which could not be routed anywhere
    pub fn unknown_frame_count(&self) -> u64 {
        self.shared.unknown_frames.load(Ordering::Relaxed)
    }

    pub(crate) fn stop_signal(&self) -> Arc<StopSignal> {
        self.shared.stop.clone()
    }

    /// A handle wired to a bare queue, with no workers behind it
    #[cfg(test)]
    pub(crate) fn detached(tx: mpsc::UnboundedSender<CanMessage>) -> Self {
        Self {
            shared: Arc::new(HandleShared {
                tx,
                stop: Arc::new(StopSignal::default()),
                emcy_callbacks: Mutex::new(std::collections::HashMap::new()),
                unknown_frames: AtomicU64::new(0),
            }),
        }
    }

    fn handle_emcy(&self, node: u8, data: &[u8]) {
        let callbacks: Vec<EmcyCallback> = self
            .shared
            .emcy_callbacks
            .lock()
            .unwrap()
            .get(&node)
            .map(|v| v.to_vec())
            .unwrap_or_default();
        if callbacks.is_empty() {
            log::debug!("Unhandled emergency frame from node {node}: {data:02X?}");
        }
        for cb in callbacks {
            cb(data);
        }
    }

    fn count_unknown(&self, msg: &CanMessage) {
        self.shared.unknown_frames.fetch_add(1, Ordering::Relaxed);
        log::debug!("Dropping frame with unknown COB-ID {}", msg.id());
    }
}

/// The core of a CANopen master
///
/// Construct with [`Core::open`] (socketcan) or [`Core::with_transport`]
/// (any transport implementing the common traits), from within a tokio
/// runtime. The NMT, SDO and PDO services are public members, mirroring
/// their on-bus independence; [`crate::Device`] composes all three.
pub struct Core {
    /// The NMT master service
    pub nmt: NmtMaster,
    /// The SDO client service
    pub sdo: SdoClient,
    /// The PDO engine
    pub pdo: PdoEngine,
    handle: CoreHandle,
    rx_task: JoinHandle<()>,
    tx_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl Core {
    /// Open a socketcan interface and start the core on it
    ///
    /// The interface bitrate is an OS-level property of the device. Must be
    /// called from within a tokio runtime.
    #[cfg(feature = "socketcan")]
    pub fn open(ifname: &str) -> Result<Self, std::io::Error> {
        let (sender, receiver) = canmaster_common::open_socketcan(ifname)?;
        Ok(Self::with_transport(sender, receiver))
    }

    /// Start the core on an arbitrary transport with default configuration
    pub fn with_transport<S, R>(sender: S, receiver: R) -> Self
    where
        S: AsyncCanSender + 'static,
        R: AsyncCanReceiver + 'static,
    {
        Self::with_config(sender, receiver, CoreConfig::default())
    }

    /// Start the core on an arbitrary transport
    ///
    /// Spawns the receive worker, the transmit worker, and the NMT liveness
    /// sweep. Must be called from within a tokio runtime.
    pub fn with_config<S, R>(sender: S, receiver: R, config: CoreConfig) -> Self
    where
        S: AsyncCanSender + 'static,
        R: AsyncCanReceiver + 'static,
    {
        let stop = Arc::new(StopSignal::default());
        let (tx, tx_queue) = mpsc::unbounded_channel();

        let handle = CoreHandle {
            shared: Arc::new(HandleShared {
                tx,
                stop: stop.clone(),
                emcy_callbacks: Mutex::new(std::collections::HashMap::new()),
                unknown_frames: AtomicU64::new(0),
            }),
        };

        let sdo = SdoClient::new(handle.clone(), config.sdo);
        let nmt = NmtMaster::new(handle.clone(), config.nmt);
        let pdo = PdoEngine::new(handle.clone());

        let rx_task = tokio::spawn(receive_worker(
            receiver,
            handle.clone(),
            sdo.clone(),
            nmt.clone(),
            pdo.clone(),
        ));
        let tx_task = tokio::spawn(transmit_worker(sender, tx_queue, stop.clone()));
        let sweep_task = nmt.spawn_sweep_task();

        Self {
            nmt,
            sdo,
            pdo,
            handle,
            rx_task,
            tx_task,
            sweep_task,
        }
    }

    /// Get a cloneable handle for sending frames and registering callbacks
    pub fn handle(&self) -> CoreHandle {
        self.handle.clone()
    }

    /// True once the core has stopped, either by request or because the
    /// transport closed
    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }

    /// Stop the core
    ///
    /// Raises the termination flag observed by the workers and by all
    /// producer tasks, and wakes in-flight SDO waiters with a `Cancelled`
    /// error.
    pub async fn stop(self) {
        self.handle.shared.stop.trigger();
        self.sdo.cancel_pending();
        for task in [self.rx_task, self.tx_task, self.sweep_task] {
            task.abort();
            let _ = task.await;
        }
    }
}

async fn transmit_worker<S: AsyncCanSender>(
    mut sender: S,
    mut queue: mpsc::UnboundedReceiver<CanMessage>,
    stop: Arc<StopSignal>,
) {
    loop {
        let msg = tokio::select! {
            _ = stop.wait() => break,
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        if let Err(e) = sender.send(msg).await {
            log::error!("Failed to send frame {}: {e:?}", msg.id());
        }
    }
}

async fn receive_worker<R: AsyncCanReceiver>(
    mut receiver: R,
    handle: CoreHandle,
    sdo: SdoClient,
    nmt: NmtMaster,
    pdo: PdoEngine,
) {
    let stop = handle.stop_signal();
    loop {
        let msg = tokio::select! {
            _ = stop.wait() => break,
            res = receiver.recv() => match res {
                Ok(msg) => msg,
                Err(e) => {
                    // The transport reported itself closed or broken; the
                    // core cannot continue without a receive stream.
                    log::error!("Transport receive failed, stopping core: {e:?}");
                    stop.trigger();
                    sdo.cancel_pending();
                    break;
                }
            },
        };
        route_frame(&handle, &sdo, &nmt, &pdo, msg);
    }
    log::debug!("Receive worker exited");
}

/// Classify one inbound frame and hand it to the owning service
fn route_frame(handle: &CoreHandle, sdo: &SdoClient, nmt: &NmtMaster, pdo: &PdoEngine, msg: CanMessage) {
    if msg.is_rtr() {
        // The master originates remote requests; it does not answer them
        log::trace!("Ignoring inbound RTR frame {}", msg.id());
        return;
    }
    let cob = match msg.id() {
        CanId::Std(cob) => cob,
        CanId::Extended(_) => {
            handle.count_unknown(&msg);
            return;
        }
    };
    match split_cob(cob) {
        Some((FunctionCode::NmtCommand, _)) => {
            // Only the master issues NMT commands; seeing one means another
            // master is on the bus
            log::trace!("Ignoring NMT command frame on the bus");
        }
        Some((FunctionCode::Sync, _)) => pdo.handle_sync(),
        Some((FunctionCode::Emergency, node)) => handle.handle_emcy(node, msg.data()),
        Some((FunctionCode::SdoResponse, node)) => sdo.route_response(node, msg.data()),
        Some((FunctionCode::SdoRequest, _)) => {
            log::trace!("Ignoring SDO request frame (client-originated)");
        }
        Some((FunctionCode::Heartbeat, node)) => nmt.handle_heartbeat(node, msg.data()),
        Some((code, _)) if code.is_pdo() => {
            if !pdo.handle_frame(cob, msg.data()) {
                log::trace!("PDO frame on 0x{cob:03X} with no registered callback");
            }
        }
        // Anything else (the TIME slot, reserved codes) may still carry a
        // manufacturer-configured PDO; deliver by exact COB-ID if one is
        // registered, otherwise count and drop.
        _ => {
            if !pdo.handle_frame(cob, msg.data()) {
                handle.count_unknown(&msg);
            }
        }
    }
}
