//! Test support for exercising the canmaster stack without hardware

pub mod sdo_slave_sim;
pub mod sim_bus;

/// Initialise logging for a test run; safe to call from every test
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// The imports every scenario test starts from
pub mod prelude {
    pub use crate::sdo_slave_sim::SdoSlaveSim;
    pub use crate::sim_bus::{SimBus, SimBusReceiver, SimBusSender};
    pub use canmaster::common::{
        nmt::NmtState, pdo::transmission_types, sdo::AbortCode, AccessType, CanId, CanMessage,
        DataType, NodeId, Value,
    };
    pub use canmaster::{
        Core, CoreConfig, Device, DeviceError, Mapping, ReadAccessMethod, RpdoNumber,
        SdoClientError, TpdoNumber, TransmissionType, WriteAccessMethod,
    };
}
