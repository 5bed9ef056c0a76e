//! Common functionality shared among the canmaster crates.
//!
//! Most users will have no reason to depend on this crate directly, as it is
//! re-exported by `canmaster` under `canmaster::common`.
#![warn(missing_docs, missing_copy_implementations)]

pub mod constants;
pub mod messages;
pub mod nmt;
pub mod node_id;
pub mod objects;
pub mod pdo;
pub mod sdo;
pub mod traits;

#[cfg(feature = "socketcan")]
mod socketcan;

#[cfg(feature = "socketcan")]
pub use socketcan::{
    open_socketcan, SocketCanReceiver, SocketCanSender, SocketSendError, TransportError,
};

pub use messages::{CanError, CanId, CanMessage, FunctionCode};
pub use node_id::NodeId;
pub use objects::{AccessType, DataType, Value};
