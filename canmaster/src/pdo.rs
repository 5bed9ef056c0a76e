//! PDO engine
//!
//! The receive path is a registry of callbacks keyed by exact COB-ID: every
//! inbound PDO frame synchronously invokes the callbacks registered for its
//! COB-ID, in registration order. The transmit path assembles 8-byte frames
//! from mapped dictionary entries and sends them either periodically (one
//! producer task per mapping) or whenever a mapped entry's value changes.

use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use canmaster_common::{CanId, CanMessage};
use slotmap::{new_key_type, SlotMap};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::core::{CoreError, CoreHandle};
use crate::object_dict::{DictionaryError, Entry, MappingSizeSnafu};

new_key_type! {
    /// Handle identifying a registered receive callback, for later removal
    pub struct PdoCallbackHandle;
}

/// When a transmit PDO mapping emits frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransmissionType {
    /// A producer task sends the frame every repeat period
    Periodic,
    /// A frame is sent whenever one of the mapped entries changes value
    OnChange,
}

/// One slot of a transmit PDO mapping, by entry name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    /// Canonical name of the mapped dictionary entry
    pub entry_name: String,
    /// Byte offset of the entry's value within the 8-byte frame
    pub offset: u8,
}

impl Mapping {
    /// Convenience constructor
    pub fn new(entry_name: &str, offset: u8) -> Self {
        Self {
            entry_name: entry_name.to_owned(),
            offset,
        }
    }
}

/// The four standard transmit PDOs of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TpdoNumber {
    /// TPDO1, COB-ID 0x180+id, parameters at 0x1800/0x1A00
    Tpdo1,
    /// TPDO2, COB-ID 0x280+id, parameters at 0x1801/0x1A01
    Tpdo2,
    /// TPDO3, COB-ID 0x380+id, parameters at 0x1802/0x1A02
    Tpdo3,
    /// TPDO4, COB-ID 0x480+id, parameters at 0x1803/0x1A03
    Tpdo4,
}

impl TpdoNumber {
    /// Index of the communication parameter object on the remote device
    pub fn comm_index(&self) -> u16 {
        canmaster_common::constants::object_ids::TPDO_COMM_BASE + *self as u16
    }

    /// Index of the mapping parameter object on the remote device
    pub fn mapping_index(&self) -> u16 {
        canmaster_common::constants::object_ids::TPDO_MAP_BASE + *self as u16
    }
}

/// The four standard receive PDOs of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpdoNumber {
    /// RPDO1, COB-ID 0x200+id, parameters at 0x1400/0x1600
    Rpdo1,
    /// RPDO2, COB-ID 0x300+id, parameters at 0x1401/0x1601
    Rpdo2,
    /// RPDO3, COB-ID 0x400+id, parameters at 0x1402/0x1602
    Rpdo3,
    /// RPDO4, COB-ID 0x500+id, parameters at 0x1403/0x1603
    Rpdo4,
}

impl RpdoNumber {
    /// Index of the communication parameter object on the remote device
    pub fn comm_index(&self) -> u16 {
        canmaster_common::constants::object_ids::RPDO_COMM_BASE + *self as u16
    }

    /// Index of the mapping parameter object on the remote device
    pub fn mapping_index(&self) -> u16 {
        canmaster_common::constants::object_ids::RPDO_MAP_BASE + *self as u16
    }
}

type PdoCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

struct Registered {
    cob: u16,
    callback: PdoCallback,
}

#[derive(Default)]
struct Registry {
    slots: SlotMap<PdoCallbackHandle, Registered>,
    // Keys per COB-ID in registration order
    by_cob: HashMap<u16, Vec<PdoCallbackHandle>>,
}

struct PdoShared {
    handle: CoreHandle,
    registry: Mutex<Registry>,
    sync_notify: Notify,
    sync_count: AtomicU64,
}

/// The PDO engine
///
/// Cloning is cheap and clones share the callback registry.
#[derive(Clone)]
pub struct PdoEngine {
    shared: Arc<PdoShared>,
}

impl PdoEngine {
    pub(crate) fn new(handle: CoreHandle) -> Self {
        Self {
            shared: Arc::new(PdoShared {
                handle,
                registry: Mutex::new(Registry::default()),
                sync_notify: Notify::new(),
                sync_count: AtomicU64::new(0),
            }),
        }
    }

    /// Register a callback for frames on an exact COB-ID
    ///
    /// Callbacks for one COB-ID run synchronously on the receive worker, in
    /// registration order, with the 0-8 byte frame payload.
    pub fn add_pdo_received_callback(
        &self,
        cob: u16,
        callback: impl Fn(&[u8]) + Send + Sync + 'static,
    ) -> PdoCallbackHandle {
        let mut registry = self.shared.registry.lock().unwrap();
        let key = registry.slots.insert(Registered {
            cob,
            callback: Arc::new(callback),
        });
        registry.by_cob.entry(cob).or_default().push(key);
        key
    }

    /// Remove a previously registered callback
    pub fn remove_pdo_received_callback(&self, handle: PdoCallbackHandle) {
        let mut registry = self.shared.registry.lock().unwrap();
        if let Some(removed) = registry.slots.remove(handle) {
            if let Some(keys) = registry.by_cob.get_mut(&removed.cob) {
                keys.retain(|k| *k != handle);
                if keys.is_empty() {
                    registry.by_cob.remove(&removed.cob);
                }
            }
        }
    }

    /// Send a remote request for the PDO on the given COB-ID
    ///
    /// The device answering will transmit the PDO, which arrives through the
    /// normal receive path.
    pub fn send_pdo_request(&self, cob: u16) -> Result<(), CoreError> {
        self.shared.handle.send(CanMessage::new_rtr(CanId::std(cob), 8))
    }

    /// Transmit a PDO frame on the given COB-ID
    pub fn send(&self, cob: u16, data: &[u8]) -> Result<(), CoreError> {
        self.shared.handle.send(CanMessage::new(CanId::std(cob), data))
    }

    /// Number of SYNC frames observed on the bus
    pub fn sync_count(&self) -> u64 {
        self.shared.sync_count.load(Ordering::Relaxed)
    }

    /// Called by the dispatcher for every inbound PDO frame
    ///
    /// Returns false if no callback is registered for the COB-ID. The
    /// registry lock is released before any callback runs.
    pub(crate) fn handle_frame(&self, cob: u16, data: &[u8]) -> bool {
        let callbacks: Vec<PdoCallback> = {
            let registry = self.shared.registry.lock().unwrap();
            match registry.by_cob.get(&cob) {
                Some(keys) => keys
                    .iter()
                    .filter_map(|k| registry.slots.get(*k))
                    .map(|r| r.callback.clone())
                    .collect(),
                None => return false,
            }
        };
        for cb in &callbacks {
            cb(data);
        }
        !callbacks.is_empty()
    }

    /// Called by the dispatcher for every SYNC frame
    ///
    /// Forwarded to the transmit schedulers as a tick: every periodic
    /// producer emits immediately.
    pub(crate) fn handle_sync(&self) {
        self.shared.sync_count.fetch_add(1, Ordering::Relaxed);
        self.shared.sync_notify.notify_waiters();
    }

    /// Spawn the producer task for a periodic transmit mapping
    pub(crate) fn spawn_periodic_transmitter(
        &self,
        pdo: Arc<TransmitPdo>,
        period: Duration,
    ) -> JoinHandle<()> {
        if period.is_zero() {
            log::warn!(
                "Repeat period for transmit PDO 0x{:03X} is 0. This could overload the bus.",
                pdo.cob
            );
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let stop = shared.handle.stop_signal();
            loop {
                // Sleep out the period (or get ticked early by SYNC), then
                // assemble and send
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = tokio::time::sleep(period) => {},
                    _ = shared.sync_notify.notified() => {},
                }
                pdo.send();
            }
        })
    }
}

/// A validated transmit PDO mapping bound to live dictionary entries
pub(crate) struct TransmitPdo {
    cob: u16,
    slots: Vec<(Arc<Entry>, u8)>,
    handle: CoreHandle,
}

impl TransmitPdo {
    /// Validate mapping slots and bind them
    ///
    /// All entries must have fixed-width types, fit the 8-byte frame, and
    /// not overlap one another.
    pub fn new(
        handle: CoreHandle,
        cob: u16,
        slots: Vec<(Arc<Entry>, u8)>,
    ) -> Result<Self, DictionaryError> {
        let mut spans: Vec<(u8, u8, &str)> = Vec::with_capacity(slots.len());
        for (entry, offset) in &slots {
            let width = entry.width().ok_or_else(|| {
                MappingSizeSnafu {
                    name: entry.name(),
                    reason: "dynamic-width types cannot be PDO mapped",
                }
                .build()
            })? as u8;
            if *offset as usize + width as usize > 8 {
                return MappingSizeSnafu {
                    name: entry.name(),
                    reason: format!("offset ({offset}) + type size ({width}) > 8"),
                }
                .fail();
            }
            spans.push((*offset, offset + width, entry.name()));
        }
        spans.sort();
        for pair in spans.windows(2) {
            if pair[1].0 < pair[0].1 {
                return MappingSizeSnafu {
                    name: pair[1].2,
                    reason: format!("overlaps the mapping of \"{}\"", pair[0].2),
                }
                .fail();
            }
        }
        Ok(Self { cob, slots, handle })
    }

    /// Assemble the 8-byte frame from a snapshot of the mapped entry values
    ///
    /// Gaps and entries that are still invalid read as zero.
    pub fn assemble(&self) -> CanMessage {
        let mut buf = [0u8; 8];
        for (entry, offset) in &self.slots {
            let bytes = entry.get_value().to_bytes();
            let offset = *offset as usize;
            let len = bytes.len().min(8 - offset);
            buf[offset..offset + len].copy_from_slice(&bytes[..len]);
        }
        CanMessage::new(CanId::std(self.cob), &buf)
    }

    /// Assemble and send one frame
    pub fn send(&self) {
        if let Err(e) = self.handle.send(self.assemble()) {
            log::warn!("Dropping transmit PDO 0x{:03X}: {e}", self.cob);
        }
    }
}
