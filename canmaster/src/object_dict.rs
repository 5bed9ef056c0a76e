//! In-memory object dictionary
//!
//! A dictionary maps `(index, subindex)` addresses to entries carrying type
//! metadata and a cached value, plus a name index from canonical entry names
//! to addresses. Every name in the index refers to an address present in the
//! dictionary.

use std::collections::{BTreeMap, HashMap};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, RwLock,
};

use canmaster_common::{AccessType, DataType, Value};
use snafu::Snafu;
use tokio::sync::Notify;

/// The address of a dictionary object: 16-bit index plus 8-bit subindex
///
/// Ordering is lexicographic, index first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    /// Object index
    pub index: u16,
    /// Object subindex
    pub sub: u8,
}

impl Address {
    /// Create an address
    pub const fn new(index: u16, sub: u8) -> Self {
        Self { index, sub }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:04X}sub{}", self.index, self.sub)
    }
}

impl From<(u16, u8)> for Address {
    fn from(value: (u16, u8)) -> Self {
        Address::new(value.0, value.1)
    }
}

/// How a read resolves to a bus service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadAccessMethod {
    /// Perform an SDO upload and refresh the cached value
    Sdo,
    /// Return the cached value, which a receive PDO mapping keeps current
    Pdo,
    /// Send a remote request on the mapped PDO COB-ID and wait (bounded) for
    /// the next inbound update
    PdoRequestAndWait,
    /// Use the entry's configured default read method
    UseDefault,
}

/// How a write resolves to a bus service
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteAccessMethod {
    /// Perform an SDO download after updating the cache
    Sdo,
    /// Update the cache only; a transmit PDO mapping carries it to the bus
    Pdo,
    /// Use the entry's configured default write method
    UseDefault,
}

/// Errors for dictionary lookups and mapping construction
///
/// These indicate caller mistakes and are never recovered internally.
#[derive(Clone, Debug, PartialEq, Snafu)]
#[snafu(visibility(pub))]
pub enum DictionaryError {
    /// No entry with this name or address
    #[snafu(display("Unknown dictionary entry \"{name}\""))]
    UnknownEntry {
        /// The name or address which failed to resolve
        name: String,
    },
    /// No operation with this name
    #[snafu(display("Unknown operation \"{name}\""))]
    UnknownOperation {
        /// The requested operation name
        name: String,
    },
    /// No constant with this name
    #[snafu(display("Unknown constant \"{name}\""))]
    UnknownConstant {
        /// The requested constant name
        name: String,
    },
    /// A value's type does not match the entry's type
    #[snafu(display("Wrong type for entry \"{name}\": entry type {expected:?}, given {given:?}"))]
    WrongType {
        /// The entry involved
        name: String,
        /// The entry's declared type
        expected: DataType,
        /// The type actually supplied, if any
        given: Option<DataType>,
    },
    /// A PDO mapping does not fit the 8-byte frame
    #[snafu(display("Invalid PDO mapping for entry \"{name}\": {reason}"))]
    MappingSize {
        /// The entry involved
        name: String,
        /// Why the mapping is rejected
        reason: String,
    },
}

/// Invariant violations of the CANopen model
#[derive(Clone, Debug, PartialEq, Snafu)]
pub enum CanOpenError {
    /// An entry already exists at this address
    #[snafu(display("Entry at {address} already exists"))]
    DuplicateEntry {
        /// The conflicting address
        address: Address,
    },
    /// An entry with this name already exists
    #[snafu(display("Entry with name \"{name}\" already exists"))]
    DuplicateName {
        /// The conflicting canonical name
        name: String,
    },
    /// An operation with this name already exists
    #[snafu(display("Operation \"{name}\" already exists"))]
    DuplicateOperation {
        /// The conflicting canonical name
        name: String,
    },
    /// A constant with this name already exists
    #[snafu(display("Constant \"{name}\" already exists"))]
    DuplicateConstant {
        /// The conflicting canonical name
        name: String,
    },
    /// The entry is not part of any receive PDO mapping
    #[snafu(display("Entry \"{name}\" has no PDO mapping"))]
    NoPdoMapping {
        /// The entry involved
        name: String,
    },
}

/// Canonicalise an entry name
///
/// Lower-cases, trims, and collapses internal whitespace runs to a single
/// underscore, so "Target Velocity " and "target_velocity" address the same
/// entry. All name lookups escape their input identically.
pub fn canonical_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_gap = false;
    for c in name.trim().chars() {
        if c.is_whitespace() {
            in_gap = true;
        } else {
            if in_gap {
                out.push('_');
                in_gap = false;
            }
            out.extend(c.to_lowercase());
        }
    }
    out
}

type ValueCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// One object dictionary entry
///
/// The cached value is `Value::Invalid` until the first successful SDO read
/// or PDO update. Value-changed subscribers run after every assignment, off
/// the entry lock.
pub struct Entry {
    address: Address,
    name: String,
    data_type: DataType,
    access_type: AccessType,
    default_value: Option<Value>,
    read_method: Mutex<ReadAccessMethod>,
    write_method: Mutex<WriteAccessMethod>,
    value: Mutex<Value>,
    subscribers: Mutex<Vec<ValueCallback>>,
    update_notify: Notify,
    disabled: AtomicBool,
    generic: AtomicBool,
}

impl Entry {
    /// Create a new entry with an invalid initial value
    ///
    /// The name is canonicalised. Default access methods are SDO.
    pub fn new(address: Address, name: &str, data_type: DataType, access_type: AccessType) -> Self {
        Self {
            address,
            name: canonical_name(name),
            data_type,
            access_type,
            default_value: None,
            read_method: Mutex::new(ReadAccessMethod::Sdo),
            write_method: Mutex::new(WriteAccessMethod::Sdo),
            value: Mutex::new(Value::Invalid),
            subscribers: Mutex::new(Vec::new()),
            update_notify: Notify::new(),
            disabled: AtomicBool::new(false),
            generic: AtomicBool::new(false),
        }
    }

    /// Attach the default value declared by an EDS file
    pub fn with_default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    /// The entry's address
    pub fn address(&self) -> Address {
        self.address
    }

    /// The entry's canonical name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The entry's data type
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// The entry's access rights
    pub fn access_type(&self) -> AccessType {
        self.access_type
    }

    /// The fixed byte width of the entry's type, or `None` for strings
    pub fn width(&self) -> Option<usize> {
        self.data_type.size()
    }

    /// The default value declared by the EDS file, if any
    pub fn default_value(&self) -> Option<&Value> {
        self.default_value.as_ref()
    }

    /// The configured default read method
    pub fn default_read_method(&self) -> ReadAccessMethod {
        *self.read_method.lock().unwrap()
    }

    /// The configured default write method
    pub fn default_write_method(&self) -> WriteAccessMethod {
        *self.write_method.lock().unwrap()
    }

    /// Change the default read method
    ///
    /// `UseDefault` is not itself a default and is ignored.
    pub fn set_default_read_method(&self, method: ReadAccessMethod) {
        if method != ReadAccessMethod::UseDefault {
            *self.read_method.lock().unwrap() = method;
        }
    }

    /// Change the default write method
    pub fn set_default_write_method(&self, method: WriteAccessMethod) {
        if method != WriteAccessMethod::UseDefault {
            *self.write_method.lock().unwrap() = method;
        }
    }

    /// A copy of the current cached value
    pub fn get_value(&self) -> Value {
        self.value.lock().unwrap().clone()
    }

    /// True until the first successful read or PDO update
    pub fn is_valid(&self) -> bool {
        !self.value.lock().unwrap().is_invalid()
    }

    /// Assign the cached value and notify subscribers and waiting readers
    ///
    /// The subscriber list is copied out before any callback runs, so
    /// callbacks may themselves read or subscribe to entries.
    pub fn set_value(&self, value: Value) {
        *self.value.lock().unwrap() = value.clone();
        let subscribers: Vec<ValueCallback> = self.subscribers.lock().unwrap().to_vec();
        for cb in subscribers {
            cb(&value);
        }
        self.update_notify.notify_waiters();
    }

    /// Register a value-changed callback
    pub fn add_value_changed_callback(&self, callback: impl Fn(&Value) + Send + Sync + 'static) {
        self.subscribers.lock().unwrap().push(Arc::new(callback));
    }

    /// Wait until the next [`Entry::set_value`] call
    ///
    /// The returned future must be created before the update can happen, or
    /// the notification may be missed.
    pub fn updated(&self) -> tokio::sync::futures::Notified<'_> {
        self.update_notify.notified()
    }

    /// Entries are disabled when a complete-dictionary read aborts on them
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Relaxed)
    }

    /// Mark the entry disabled or enabled
    pub fn set_disabled(&self, disabled: bool) {
        self.disabled.store(disabled, Ordering::Relaxed);
    }

    /// True for entries added from a CiA profile rather than a device EDS
    pub fn is_generic(&self) -> bool {
        self.generic.load(Ordering::Relaxed)
    }

    pub(crate) fn set_generic(&self, generic: bool) {
        self.generic.store(generic, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("address", &self.address)
            .field("name", &self.name)
            .field("data_type", &self.data_type)
            .field("access_type", &self.access_type)
            .field("value", &self.get_value())
            .finish()
    }
}

impl std::fmt::Display for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} ({:?}, {:?}) = {}",
            self.address,
            self.name,
            self.data_type,
            self.access_type,
            self.get_value()
        )
    }
}

/// The dictionary: addresses to entries, plus a unique name index
///
/// Interior locking allows shared use from the receive worker, producer
/// tasks, and caller threads. The whole dictionary is guarded by a
/// read/write lock; individual values lock per entry.
#[derive(Default)]
pub struct ObjectDictionary {
    entries: RwLock<BTreeMap<Address, Arc<Entry>>>,
    names: RwLock<HashMap<String, Address>>,
}

impl ObjectDictionary {
    /// Create an empty dictionary
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every entry and name
    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.names.write().unwrap().clear();
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// True if the dictionary holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }

    /// Add a new entry
    ///
    /// Fails if an entry already exists at the address or under the name;
    /// use [`ObjectDictionary::replace`] to overwrite.
    pub fn insert(&self, entry: Entry) -> Result<Arc<Entry>, CanOpenError> {
        let mut entries = self.entries.write().unwrap();
        let mut names = self.names.write().unwrap();
        if entries.contains_key(&entry.address) {
            return DuplicateEntrySnafu {
                address: entry.address,
            }
            .fail();
        }
        if names.contains_key(&entry.name) {
            return DuplicateNameSnafu {
                name: entry.name.clone(),
            }
            .fail();
        }
        let entry = Arc::new(entry);
        names.insert(entry.name.clone(), entry.address);
        entries.insert(entry.address, entry.clone());
        Ok(entry)
    }

    /// Add an entry, overwriting any existing entry at the same address
    ///
    /// The replaced entry's name is dropped from the name index; subscribers
    /// registered on the replaced entry are dropped with it.
    pub fn replace(&self, entry: Entry) -> Arc<Entry> {
        let mut entries = self.entries.write().unwrap();
        let mut names = self.names.write().unwrap();
        if let Some(old) = entries.remove(&entry.address) {
            names.remove(&old.name);
        }
        names.insert(entry.name.clone(), entry.address);
        let entry = Arc::new(entry);
        entries.insert(entry.address, entry.clone());
        entry
    }

    /// Add an additional name for an existing address
    ///
    /// Used when merging CiA profile names onto a manufacturer dictionary.
    /// Fails if the name is taken or the address is unknown.
    pub fn add_name_alias(&self, name: &str, address: Address) -> Result<(), CanOpenError> {
        let name = canonical_name(name);
        let entries = self.entries.read().unwrap();
        let mut names = self.names.write().unwrap();
        if !entries.contains_key(&address) {
            // The invariant says every name points at a present entry
            return DuplicateEntrySnafu { address }.fail();
        }
        if names.contains_key(&name) {
            return DuplicateNameSnafu { name }.fail();
        }
        names.insert(name, address);
        Ok(())
    }

    /// Look up an entry by address
    pub fn get(&self, address: Address) -> Option<Arc<Entry>> {
        self.entries.read().unwrap().get(&address).cloned()
    }

    /// Look up an entry by (canonicalised) name
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Entry>> {
        let address = self.address_of(name)?;
        self.get(address)
    }

    /// Resolve a name to its address
    pub fn address_of(&self, name: &str) -> Option<Address> {
        self.names
            .read()
            .unwrap()
            .get(&canonical_name(name))
            .copied()
    }

    /// True if an entry exists at the address
    pub fn contains(&self, address: Address) -> bool {
        self.entries.read().unwrap().contains_key(&address)
    }

    /// True if an entry is reachable under the name
    pub fn contains_name(&self, name: &str) -> bool {
        self.names
            .read()
            .unwrap()
            .contains_key(&canonical_name(name))
    }

    /// All entries, sorted by address
    pub fn entries_sorted(&self) -> Vec<Arc<Entry>> {
        self.entries.read().unwrap().values().cloned().collect()
    }
}

impl std::fmt::Display for ObjectDictionary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for entry in self.entries_sorted() {
            if !entry.is_disabled() {
                writeln!(f, "{entry}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_entry(index: u16, sub: u8, name: &str) -> Entry {
        Entry::new(
            Address::new(index, sub),
            name,
            DataType::U16,
            AccessType::ReadWrite,
        )
    }

    #[test]
    fn test_canonical_name() {
        assert_eq!("target_velocity", canonical_name("Target Velocity"));
        assert_eq!("target_velocity", canonical_name("  target\t \nVELOCITY  "));
        assert_eq!("controlword", canonical_name("Controlword"));
    }

    #[test]
    fn test_name_index_invariant() {
        let dict = ObjectDictionary::new();
        dict.insert(u16_entry(0x6040, 0, "Controlword")).unwrap();
        dict.insert(u16_entry(0x6041, 0, "Statusword")).unwrap();
        for entry in dict.entries_sorted() {
            assert_eq!(
                entry.address(),
                dict.address_of(entry.name()).unwrap(),
                "name index must point at the entry's own address"
            );
        }
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let dict = ObjectDictionary::new();
        dict.insert(u16_entry(0x6040, 0, "Controlword")).unwrap();
        assert_eq!(
            Err(CanOpenError::DuplicateEntry {
                address: Address::new(0x6040, 0)
            }),
            dict.insert(u16_entry(0x6040, 0, "Other"))
                .map(|_| ())
        );
        assert_eq!(
            Err(CanOpenError::DuplicateName {
                name: "controlword".into()
            }),
            dict.insert(u16_entry(0x6042, 0, "controlword"))
                .map(|_| ())
        );
    }

    #[test]
    fn test_replace_overwrites() {
        let dict = ObjectDictionary::new();
        dict.insert(u16_entry(0x6040, 0, "Controlword")).unwrap();
        dict.replace(u16_entry(0x6040, 0, "New Controlword"));
        assert_eq!(1, dict.len());
        assert!(!dict.contains_name("controlword"));
        assert!(dict.contains_name("new controlword"));
    }

    #[test]
    fn test_name_alias() {
        let dict = ObjectDictionary::new();
        dict.insert(u16_entry(0x6040, 0, "Vendor Controlword"))
            .unwrap();
        dict.add_name_alias("Controlword", Address::new(0x6040, 0))
            .unwrap();
        assert_eq!(
            dict.get_by_name("controlword").unwrap().address(),
            Address::new(0x6040, 0)
        );
        assert!(dict
            .add_name_alias("missing", Address::new(0x7000, 0))
            .is_err());
    }

    #[test]
    fn test_entry_starts_invalid_and_notifies() {
        let entry = u16_entry(0x6041, 0, "Statusword");
        assert!(!entry.is_valid());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        entry.add_value_changed_callback(move |v| seen_cb.lock().unwrap().push(v.clone()));
        entry.set_value(Value::U16(0x1234));
        assert!(entry.is_valid());
        assert_eq!(vec![Value::U16(0x1234)], *seen.lock().unwrap());
    }

    #[tokio::test]
    async fn test_updated_wakes_waiter() {
        let entry = Arc::new(u16_entry(0x6041, 0, "Statusword"));
        let waiter = entry.clone();
        let wait = tokio::spawn(async move {
            waiter.updated().await;
            waiter.get_value()
        });
        // Give the waiter a chance to register before the update
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        entry.set_value(Value::U16(7));
        assert_eq!(Value::U16(7), wait.await.unwrap());
    }
}
