//! A master-side CANopen stack
//!
//! The [`Core`] owns the bus: it runs a receive worker which demultiplexes
//! inbound frames into the [`NmtMaster`], the [`SdoClient`] and the
//! [`PdoEngine`], and a transmit worker which serialises outbound frames.
//! On top of it, a [`Device`] binds an EDS-described object dictionary to a
//! single remote node and routes entry reads and writes over the appropriate
//! service.
//!
//! ```no_run
//! use canmaster::{Core, Device, WriteAccessMethod};
//! use canmaster::common::{NodeId, Value};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let core = Core::open("can0")?;
//! let device = Device::new(&core, NodeId::new(3)?);
//! device.load_dictionary_from_library().await?;
//! device.start().await?;
//! device
//!     .set_entry("target_velocity", Value::I32(500), WriteAccessMethod::Sdo)
//!     .await?;
//! core.stop().await;
//! # Ok(())
//! # }
//! ```

pub use canmaster_common as common;

mod core;
pub mod device;
pub mod eds;
pub mod nmt_master;
pub mod object_dict;
pub mod pdo;
pub mod profiles;
pub mod sdo_client;

pub use crate::core::{Core, CoreConfig, CoreError, CoreHandle};
pub use device::{Device, DeviceConfig, DeviceError, ReadAccessMethod, WriteAccessMethod};
pub use nmt_master::{DeviceLiveness, NmtMaster, NmtMasterConfig};
pub use object_dict::{Address, CanOpenError, DictionaryError, Entry, ObjectDictionary};
pub use pdo::{Mapping, PdoEngine, RpdoNumber, TpdoNumber, TransmissionType};
pub use sdo_client::{SdoClient, SdoClientConfig, SdoClientError};
