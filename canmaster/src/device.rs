//! Per-node device facade
//!
//! A [`Device`] binds an object dictionary to one remote node and routes
//! entry reads and writes over the appropriate service: SDO transactions for
//! configuration access, cached values kept current by receive PDO mappings
//! for process data, or a remote request followed by a bounded wait. It also
//! carries the node-facing conveniences: profile operation and constant
//! tables, remote PDO remapping, and heartbeat production.

use std::collections::{hash_map, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canmaster_common::{
    constants::{cob_ids, object_ids, PDO_COB_ID_DISABLE_BIT},
    nmt::NmtState,
    objects::ValueError,
    AccessType, CanId, CanMessage, DataType, NodeId, Value,
};
use futures::future::BoxFuture;
use snafu::Snafu;
use tokio::task::JoinHandle;

use crate::core::{Core, CoreError, CoreHandle};
use crate::eds::{self, EdsError, LoadOptions};
use crate::nmt_master::NmtMaster;
use crate::object_dict::{
    canonical_name, Address, CanOpenError, DictionaryError, Entry, MappingSizeSnafu,
    ObjectDictionary, UnknownEntrySnafu, UnknownOperationSnafu, WrongTypeSnafu,
};
pub use crate::object_dict::{ReadAccessMethod, WriteAccessMethod};
use crate::pdo::{Mapping, PdoCallbackHandle, PdoEngine, RpdoNumber, TpdoNumber, TransmissionType, TransmitPdo};
use crate::profiles;
use crate::sdo_client::{SdoClient, SdoClientError};

/// An operation bound to a device: a named async closure taking an argument
/// value and yielding a result value
pub type Operation =
    Arc<dyn for<'a> Fn(&'a Device, Value) -> BoxFuture<'a, Result<Value, DeviceError>> + Send + Sync>;

/// Errors surfaced by [`Device`] methods
#[derive(Debug, Snafu)]
pub enum DeviceError {
    /// An SDO transaction failed
    #[snafu(context(false), display("{source}"))]
    Sdo {
        /// The underlying SDO error
        source: SdoClientError,
    },
    /// A dictionary lookup or mapping failed
    #[snafu(context(false), display("{source}"))]
    Dictionary {
        /// The underlying dictionary error
        source: DictionaryError,
    },
    /// A CANopen invariant was violated
    #[snafu(context(false), display("{source}"))]
    CanOpen {
        /// The underlying error
        source: CanOpenError,
    },
    /// An EDS file could not be loaded
    #[snafu(context(false), display("{source}"))]
    Eds {
        /// The underlying EDS error
        source: EdsError,
    },
    /// The core refused to send a frame
    #[snafu(context(false), display("{source}"))]
    Core {
        /// The underlying core error
        source: CoreError,
    },
    /// A payload received for an entry could not be decoded as its type
    #[snafu(display("Value for \"{name}\" could not be decoded: {source}"))]
    BadValue {
        /// The entry involved
        name: String,
        /// The underlying conversion error
        source: ValueError,
    },
    /// No PDO update arrived within the configured wait
    #[snafu(display("Timed out waiting for a PDO update of \"{name}\""))]
    PdoRequestTimeout {
        /// The entry involved
        name: String,
    },
}

/// Configuration of a [`Device`]
#[derive(Clone, Copy, Debug)]
pub struct DeviceConfig {
    /// How long `get_entry` with [`ReadAccessMethod::PdoRequestAndWait`]
    /// waits for the requested PDO to arrive
    pub pdo_request_timeout: Duration,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            pdo_request_timeout: Duration::from_millis(1000),
        }
    }
}

/// A single remote node and its object dictionary
///
/// The device holds handles into the [`Core`] services; the core must be
/// kept alive (not stopped) for the device to function. Dropping the device
/// unregisters its PDO callbacks and stops its producer tasks.
pub struct Device {
    handle: CoreHandle,
    sdo: SdoClient,
    nmt: NmtMaster,
    pdo: PdoEngine,
    node_id: NodeId,
    config: DeviceConfig,
    dictionary: Arc<ObjectDictionary>,
    operations: Mutex<HashMap<String, Operation>>,
    constants: Mutex<HashMap<String, Value>>,
    // Maps entry names to the COB-ID of their receive PDO, for RTR requests
    receive_cobs: Mutex<HashMap<String, u16>>,
    pdo_handles: Mutex<Vec<PdoCallbackHandle>>,
    producer_tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Create a device for the given node with default configuration
    pub fn new(core: &Core, node_id: NodeId) -> Self {
        Self::with_config(core, node_id, DeviceConfig::default())
    }

    /// Create a device for the given node
    pub fn with_config(core: &Core, node_id: NodeId, config: DeviceConfig) -> Self {
        Self {
            handle: core.handle(),
            sdo: core.sdo.clone(),
            nmt: core.nmt.clone(),
            pdo: core.pdo.clone(),
            node_id,
            config,
            dictionary: Arc::new(ObjectDictionary::new()),
            operations: Mutex::new(HashMap::new()),
            constants: Mutex::new(HashMap::new()),
            receive_cobs: Mutex::new(HashMap::new()),
            pdo_handles: Mutex::new(Vec::new()),
            producer_tasks: Mutex::new(Vec::new()),
            heartbeat_task: Mutex::new(None),
        }
    }

    /// The node this device talks to
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The device's object dictionary
    pub fn dictionary(&self) -> &ObjectDictionary {
        &self.dictionary
    }

    /// Load the profile operation and constant tables and start the node
    ///
    /// Reading the device profile requires a responding SDO server; when the
    /// read fails the profile tables are skipped and the node is started
    /// anyway.
    pub async fn start(&self) -> Result<(), DeviceError> {
        match self.load_profile_tables().await {
            Ok(true) => {}
            Ok(false) => log::debug!(
                "No built-in operations for the profile of node {}",
                self.node_id
            ),
            Err(e) => log::warn!(
                "Could not load profile tables for node {}: {e}",
                self.node_id
            ),
        }
        self.nmt.start_node(self.node_id)?;
        Ok(())
    }

    /// The device profile number: the low 16 bits of object 0x1000
    pub async fn get_device_profile_number(&self) -> Result<u16, DeviceError> {
        let address = Address::new(object_ids::DEVICE_TYPE, 0);
        let device_type: u32 = if self.dictionary.contains(address) {
            let value = self.get_entry_at(address, ReadAccessMethod::Sdo).await?;
            u32::try_from(&value).map_err(|source| DeviceError::BadValue {
                name: "device_type".into(),
                source,
            })?
        } else {
            self.sdo
                .upload_u32(self.node_id, object_ids::DEVICE_TYPE, 0)
                .await?
        };
        Ok((device_type & 0xFFFF) as u16)
    }

    // --- Dictionary access -------------------------------------------------

    /// True if an entry is reachable under the name
    pub fn has_entry(&self, name: &str) -> bool {
        self.dictionary.contains_name(name)
    }

    /// True if an entry exists at the address
    pub fn has_entry_at(&self, address: Address) -> bool {
        self.dictionary.contains(address)
    }

    /// The declared type of an entry
    pub fn get_entry_type(&self, name: &str) -> Result<DataType, DeviceError> {
        Ok(self.entry_by_name(name)?.data_type())
    }

    /// Read an entry by name
    ///
    /// See [`ReadAccessMethod`] for how the value is obtained.
    pub async fn get_entry(&self, name: &str, method: ReadAccessMethod) -> Result<Value, DeviceError> {
        let entry = self.entry_by_name(name)?;
        self.read_entry(entry, method).await
    }

    /// Read an entry by address
    pub async fn get_entry_at(
        &self,
        address: Address,
        method: ReadAccessMethod,
    ) -> Result<Value, DeviceError> {
        let entry = self.entry_at(address)?;
        self.read_entry(entry, method).await
    }

    /// Write an entry by name
    ///
    /// The value is type-checked against the entry, the cached value is
    /// updated (notifying subscribers), and for SDO writes the value is
    /// downloaded to the node.
    pub async fn set_entry(
        &self,
        name: &str,
        value: Value,
        method: WriteAccessMethod,
    ) -> Result<(), DeviceError> {
        let entry = self.entry_by_name(name)?;
        self.write_entry(entry, value, method).await
    }

    /// Write an entry by address
    pub async fn set_entry_at(
        &self,
        address: Address,
        value: Value,
        method: WriteAccessMethod,
    ) -> Result<(), DeviceError> {
        let entry = self.entry_at(address)?;
        self.write_entry(entry, value, method).await
    }

    /// Add a dictionary entry
    ///
    /// Fails if an entry already exists at the address or under the name.
    pub fn add_entry(
        &self,
        index: u16,
        sub: u8,
        name: &str,
        data_type: DataType,
        access_type: AccessType,
    ) -> Result<(), DeviceError> {
        self.dictionary
            .insert(Entry::new(Address::new(index, sub), name, data_type, access_type))?;
        Ok(())
    }

    /// Add a dictionary entry, overwriting any existing entry at the address
    pub fn replace_entry(
        &self,
        index: u16,
        sub: u8,
        name: &str,
        data_type: DataType,
        access_type: AccessType,
    ) {
        self.dictionary
            .replace(Entry::new(Address::new(index, sub), name, data_type, access_type));
    }

    /// Read every dictionary entry once via SDO
    ///
    /// Entries the node aborts on are disabled rather than failing the call,
    /// so a profile dictionary can be pruned down to what the node actually
    /// implements.
    pub async fn read_complete_dictionary(&self) {
        for entry in self.dictionary.entries_sorted() {
            if entry.is_disabled() {
                continue;
            }
            if let Err(e) = self.read_entry(entry.clone(), ReadAccessMethod::Sdo).await {
                entry.set_disabled(true);
                log::debug!(
                    "SDO error for field {}: {e} -> disabling entry",
                    entry.name()
                );
            }
        }
    }

    fn entry_by_name(&self, name: &str) -> Result<Arc<Entry>, DictionaryError> {
        self.dictionary
            .get_by_name(name)
            .ok_or_else(|| UnknownEntrySnafu { name }.build())
    }

    fn entry_at(&self, address: Address) -> Result<Arc<Entry>, DictionaryError> {
        self.dictionary
            .get(address)
            .ok_or_else(|| {
                UnknownEntrySnafu {
                    name: address.to_string(),
                }
                .build()
            })
    }

    async fn read_entry(
        &self,
        entry: Arc<Entry>,
        method: ReadAccessMethod,
    ) -> Result<Value, DeviceError> {
        let method = match method {
            ReadAccessMethod::UseDefault => entry.default_read_method(),
            method => method,
        };
        match method {
            ReadAccessMethod::Sdo | ReadAccessMethod::UseDefault => {
                let address = entry.address();
                let bytes = self
                    .sdo
                    .upload(self.node_id, address.index, address.sub)
                    .await?;
                let value = Value::from_bytes(entry.data_type(), &bytes).map_err(|source| {
                    DeviceError::BadValue {
                        name: entry.name().to_owned(),
                        source,
                    }
                })?;
                entry.set_value(value.clone());
                Ok(value)
            }
            ReadAccessMethod::Pdo => Ok(entry.get_value()),
            ReadAccessMethod::PdoRequestAndWait => {
                let cob = self
                    .receive_cobs
                    .lock()
                    .unwrap()
                    .get(entry.name())
                    .copied()
                    .ok_or_else(|| CanOpenError::NoPdoMapping {
                        name: entry.name().to_owned(),
                    })?;
                // Arm the notification before requesting, or the update
                // could slip through between the two
                let updated = entry.updated();
                self.pdo.send_pdo_request(cob)?;
                match tokio::time::timeout(self.config.pdo_request_timeout, updated).await {
                    Ok(()) => Ok(entry.get_value()),
                    Err(_) => PdoRequestTimeoutSnafu { name: entry.name() }.fail(),
                }
            }
        }
    }

    async fn write_entry(
        &self,
        entry: Arc<Entry>,
        value: Value,
        method: WriteAccessMethod,
    ) -> Result<(), DeviceError> {
        if value.data_type() != Some(entry.data_type()) {
            return Err(WrongTypeSnafu {
                name: entry.name(),
                expected: entry.data_type(),
                given: value.data_type(),
            }
            .build()
            .into());
        }
        let method = match method {
            WriteAccessMethod::UseDefault => entry.default_write_method(),
            method => method,
        };
        entry.set_value(value.clone());
        if matches!(method, WriteAccessMethod::Sdo | WriteAccessMethod::UseDefault) {
            let address = entry.address();
            self.sdo
                .download(self.node_id, address.index, address.sub, &value.to_bytes())
                .await?;
        }
        Ok(())
    }

    // --- Operations and constants ------------------------------------------

    /// Bind a named operation to this device
    ///
    /// Fails if the name is taken.
    pub fn add_operation(&self, name: &str, operation: Operation) -> Result<(), DeviceError> {
        let name = canonical_name(name);
        match self.operations.lock().unwrap().entry(name.clone()) {
            hash_map::Entry::Occupied(_) => Err(CanOpenError::DuplicateOperation { name }.into()),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(operation);
                Ok(())
            }
        }
    }

    /// Invoke a named operation
    pub async fn execute(&self, operation: &str, argument: Value) -> Result<Value, DeviceError> {
        let name = canonical_name(operation);
        let op = self
            .operations
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| UnknownOperationSnafu { name }.build())?;
        op(self, argument).await
    }

    /// Add a named constant
    ///
    /// Fails if the name is taken.
    pub fn add_constant(&self, name: &str, value: Value) -> Result<(), DeviceError> {
        let name = canonical_name(name);
        match self.constants.lock().unwrap().entry(name.clone()) {
            hash_map::Entry::Occupied(_) => Err(CanOpenError::DuplicateConstant { name }.into()),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(value);
                Ok(())
            }
        }
    }

    /// Look up a named constant
    pub fn get_constant(&self, name: &str) -> Result<Value, DeviceError> {
        let name = canonical_name(name);
        self.constants
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| crate::object_dict::UnknownConstantSnafu { name }.build().into())
    }

    /// Load operations and constants for the node's device profile
    ///
    /// Returns true if the profile contributed any.
    async fn load_profile_tables(&self) -> Result<bool, DeviceError> {
        let profile = self.get_device_profile_number().await?;
        let mut any = false;
        {
            let mut operations = self.operations.lock().unwrap();
            for (name, op) in profiles::operations(profile) {
                operations.entry(canonical_name(name)).or_insert(op);
                any = true;
            }
        }
        {
            let mut constants = self.constants.lock().unwrap();
            for (name, value) in profiles::constants(profile) {
                constants.entry(canonical_name(name)).or_insert(value);
                any = true;
            }
        }
        Ok(any)
    }

    // --- PDO bindings -------------------------------------------------------

    /// Keep an entry current from an inbound PDO
    ///
    /// Installs a callback for the COB-ID that slices the entry's bytes out
    /// of the payload at `offset`, builds a typed value, and assigns it to
    /// the entry (notifying its subscribers). Payloads too short for the
    /// mapping are logged and dropped. The entry's default read method
    /// becomes PDO.
    pub fn add_receive_pdo_mapping(
        &self,
        cob: u16,
        entry_name: &str,
        offset: u8,
    ) -> Result<(), DeviceError> {
        let entry = self.entry_by_name(entry_name)?;
        let width = entry.width().ok_or_else(|| {
            MappingSizeSnafu {
                name: entry.name(),
                reason: "dynamic-width types cannot be PDO mapped",
            }
            .build()
        })?;
        if offset as usize + width > 8 {
            return Err(MappingSizeSnafu {
                name: entry.name(),
                reason: format!("offset ({offset}) + type size ({width}) > 8"),
            }
            .build()
            .into());
        }

        let name = entry.name().to_owned();
        let cb_entry = entry.clone();
        let handle = self.pdo.add_pdo_received_callback(cob, move |data| {
            let start = offset as usize;
            if data.len() < start + width {
                log::warn!(
                    "PDO on 0x{cob:03X} has wrong size ({} < {}), ignoring it",
                    data.len(),
                    start + width
                );
                return;
            }
            match Value::from_bytes(cb_entry.data_type(), &data[start..start + width]) {
                Ok(value) => cb_entry.set_value(value),
                Err(e) => log::warn!("Could not decode PDO slice for \"{}\": {e}", cb_entry.name()),
            }
        });
        self.pdo_handles.lock().unwrap().push(handle);
        self.receive_cobs.lock().unwrap().insert(name, cob);
        entry.set_default_read_method(ReadAccessMethod::Pdo);
        Ok(())
    }

    /// Transmit mapped entries as a PDO
    ///
    /// For [`TransmissionType::Periodic`], a producer task assembles and
    /// sends the frame every `period` (a zero period is allowed but warned
    /// about). For [`TransmissionType::OnChange`], a frame is sent whenever
    /// any mapped entry's value changes. Mapped entries default to PDO
    /// writes afterwards.
    pub fn add_transmit_pdo_mapping(
        &self,
        cob: u16,
        mappings: &[Mapping],
        transmission_type: TransmissionType,
        period: Duration,
    ) -> Result<(), DeviceError> {
        let mut slots = Vec::with_capacity(mappings.len());
        for mapping in mappings {
            slots.push((self.entry_by_name(&mapping.entry_name)?, mapping.offset));
        }
        let pdo = Arc::new(TransmitPdo::new(self.handle.clone(), cob, slots.clone())?);

        match transmission_type {
            TransmissionType::Periodic => {
                let task = self.pdo.spawn_periodic_transmitter(pdo, period);
                self.producer_tasks.lock().unwrap().push(task);
            }
            TransmissionType::OnChange => {
                for (entry, _) in &slots {
                    let pdo = pdo.clone();
                    entry.add_value_changed_callback(move |_| pdo.send());
                    entry.set_default_write_method(WriteAccessMethod::Pdo);
                }
            }
        }
        Ok(())
    }

    // --- Remote PDO remapping ----------------------------------------------

    /// Install a TPDO mapping on the remote device
    ///
    /// Writes the communication and mapping parameter objects over SDO in
    /// the standard sequence: disable the PDO (set bit 31 of its COB-ID),
    /// clear the mapping count, write the packed mapping words, write the
    /// count, write the transmission type and optional inhibit time and
    /// event timer, then re-enable the PDO (clear bit 31). Any failing step
    /// aborts the sequence.
    ///
    /// The common `transmit_type` values are named in
    /// [`canmaster_common::pdo::transmission_types`].
    pub async fn map_tpdo_in_device(
        &self,
        tpdo: TpdoNumber,
        entries_to_be_mapped: &[u32],
        transmit_type: u8,
        inhibit_time: Option<u16>,
        event_timer: Option<u16>,
    ) -> Result<(), DeviceError> {
        self.remap_pdo(
            tpdo.comm_index(),
            tpdo.mapping_index(),
            entries_to_be_mapped,
            transmit_type,
            inhibit_time,
            event_timer,
        )
        .await
    }

    /// Install an RPDO mapping on the remote device
    ///
    /// The RPDO counterpart of [`Device::map_tpdo_in_device`]; `transmit_type`
    /// takes the same [`transmission_types`] values.
    ///
    /// [`transmission_types`]: canmaster_common::pdo::transmission_types
    pub async fn map_rpdo_in_device(
        &self,
        rpdo: RpdoNumber,
        entries_to_be_mapped: &[u32],
        transmit_type: u8,
    ) -> Result<(), DeviceError> {
        self.remap_pdo(
            rpdo.comm_index(),
            rpdo.mapping_index(),
            entries_to_be_mapped,
            transmit_type,
            None,
            None,
        )
        .await
    }

    async fn remap_pdo(
        &self,
        comm_index: u16,
        mapping_index: u16,
        entries: &[u32],
        transmit_type: u8,
        inhibit_time: Option<u16>,
        event_timer: Option<u16>,
    ) -> Result<(), DeviceError> {
        let node = self.node_id;

        let cob = self.sdo.upload_u32(node, comm_index, 1).await?;
        self.sdo
            .download_u32(node, comm_index, 1, cob | PDO_COB_ID_DISABLE_BIT)
            .await?;

        self.sdo.download_u8(node, mapping_index, 0, 0).await?;
        for (i, word) in entries.iter().enumerate() {
            self.sdo
                .download_u32(node, mapping_index, i as u8 + 1, *word)
                .await?;
        }
        self.sdo
            .download_u8(node, mapping_index, 0, entries.len() as u8)
            .await?;

        self.sdo
            .download_u8(node, comm_index, 2, transmit_type)
            .await?;
        if let Some(inhibit_time) = inhibit_time {
            self.sdo
                .download_u16(node, comm_index, 3, inhibit_time)
                .await?;
        }
        if let Some(event_timer) = event_timer {
            self.sdo
                .download_u16(node, comm_index, 5, event_timer)
                .await?;
        }

        self.sdo
            .download_u32(node, comm_index, 1, cob & !PDO_COB_ID_DISABLE_BIT)
            .await?;
        Ok(())
    }

    // --- Heartbeat production ----------------------------------------------

    /// Produce heartbeat frames on behalf of the master
    ///
    /// Spawns a producer that sends a heartbeat frame for `node` (one state
    /// byte on `0x700+node`, or a remote frame when `rtr` is set) every
    /// `interval` until the device is dropped or
    /// [`Device::stop_request_heartbeat`] is called. Only one producer runs
    /// per device.
    pub fn request_heartbeat(&self, node: u8, interval: Duration, rtr: bool, state: NmtState) {
        if interval.is_zero() {
            log::warn!("Heartbeat interval is 0; not starting a producer");
            return;
        }
        let mut slot = self.heartbeat_task.lock().unwrap();
        if slot.is_some() {
            log::warn!("Heartbeat producer for node {node} already running");
            return;
        }
        let handle = self.handle.clone();
        *slot = Some(tokio::spawn(async move {
            let stop = handle.stop_signal();
            let id = CanId::std(cob_ids::HEARTBEAT_BASE + node as u16);
            loop {
                let frame = if rtr {
                    CanMessage::new_rtr(id, 1)
                } else {
                    CanMessage::new(id, &[state as u8])
                };
                if handle.send(frame).is_err() {
                    break;
                }
                tokio::select! {
                    _ = stop.wait() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }));
    }

    /// Stop the heartbeat producer, if one is running
    pub fn stop_request_heartbeat(&self) {
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
    }

    // --- Emergency frames ---------------------------------------------------

    /// Register a callback for emergency frames from this node
    pub fn register_emcy_callback(&self, callback: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.handle
            .register_emcy_callback(self.node_id.raw(), callback);
    }

    // --- Dictionary loading -------------------------------------------------

    /// Replace the dictionary with the content of an EDS file
    ///
    /// After the manufacturer entries are imported, standard names from the
    /// CiA profile dictionaries are merged on top in name-only mode, so
    /// entries remain reachable under both their vendor and their standard
    /// names.
    pub async fn load_dictionary_from_eds(&self, path: impl AsRef<Path>) -> Result<(), DeviceError> {
        eds::load_eds_file(
            &self.dictionary,
            path,
            &LoadOptions {
                clear_dictionary: true,
                ..Default::default()
            },
        )?;
        // 0x1000 is needed to look up the profile dictionary
        if !self.dictionary.contains(Address::new(object_ids::DEVICE_TYPE, 0)) {
            self.add_entry(
                object_ids::DEVICE_TYPE,
                0,
                "device_type",
                DataType::U32,
                AccessType::ReadOnly,
            )?;
        }
        self.load_cia_dictionary(true).await
    }

    /// Build the dictionary from the built-in CiA profile library
    ///
    /// Used when no device EDS is available: loads the profile dictionary
    /// selected by the node's device type, or the mandatory CiA-301 entries
    /// when the profile is unknown.
    pub async fn load_dictionary_from_library(&self) -> Result<(), DeviceError> {
        self.dictionary.clear();
        self.load_cia_dictionary(false).await
    }

    async fn load_cia_dictionary(&self, just_add_names: bool) -> Result<(), DeviceError> {
        let options = LoadOptions {
            clear_dictionary: false,
            just_add_names,
            mark_generic: true,
        };
        let profile = self.get_device_profile_number().await?;
        if !eds::library::load_default_eds(&self.dictionary, profile, &options)? {
            eds::library::load_mandatory_entries(&self.dictionary, &options)?;
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        for handle in self.pdo_handles.lock().unwrap().drain(..) {
            self.pdo.remove_pdo_received_callback(handle);
        }
        self.handle.clear_emcy_callbacks(self.node_id.raw());
        for task in self.producer_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(task) = self.heartbeat_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("node_id", &self.node_id)
            .field("entries", &self.dictionary.len())
            .finish()
    }
}
