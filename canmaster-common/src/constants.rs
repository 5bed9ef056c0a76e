//! Constants defining standard objects and COB-ID bases

/// Object indices for standard objects
pub mod object_ids {
    /// The device type object index; low 16 bits carry the device profile
    pub const DEVICE_TYPE: u16 = 0x1000;
    /// The error register object index
    pub const ERROR_REGISTER: u16 = 0x1001;
    /// The Device Name object index
    pub const DEVICE_NAME: u16 = 0x1008;
    /// The hardware version object index
    pub const HARDWARE_VERSION: u16 = 0x1009;
    /// The software version object index
    pub const SOFTWARE_VERSION: u16 = 0x100A;
    /// The heartbeat producer time object index
    pub const HEARTBEAT_PRODUCER_TIME: u16 = 0x1017;
    /// The identity object index
    pub const IDENTITY: u16 = 0x1018;

    /// The first RPDO communication parameter index (0x1400-0x15FF)
    pub const RPDO_COMM_BASE: u16 = 0x1400;
    /// The first RPDO mapping parameter index (0x1600-0x17FF)
    pub const RPDO_MAP_BASE: u16 = 0x1600;
    /// The first TPDO communication parameter index (0x1800-0x19FF)
    pub const TPDO_COMM_BASE: u16 = 0x1800;
    /// The first TPDO mapping parameter index (0x1A00-0x1BFF)
    pub const TPDO_MAP_BASE: u16 = 0x1A00;
}

/// COB-ID bases of the CiA-301 pre-defined connection set
pub mod cob_ids {
    /// NMT command COB-ID
    pub const NMT: u16 = 0x000;
    /// SYNC COB-ID
    pub const SYNC: u16 = 0x080;
    /// Emergency COB-ID base (add the node ID)
    pub const EMCY_BASE: u16 = 0x080;
    /// First transmit PDO base (add the node ID)
    pub const TPDO1_BASE: u16 = 0x180;
    /// First receive PDO base (add the node ID)
    pub const RPDO1_BASE: u16 = 0x200;
    /// SDO server-to-client response base (add the node ID)
    pub const SDO_RESPONSE_BASE: u16 = 0x580;
    /// SDO client-to-server request base (add the node ID)
    pub const SDO_REQUEST_BASE: u16 = 0x600;
    /// Heartbeat / node guard base (add the node ID)
    pub const HEARTBEAT_BASE: u16 = 0x700;
}

/// Bit 31 of a PDO communication parameter COB-ID entry disables the PDO
pub const PDO_COB_ID_DISABLE_BIT: u32 = 1 << 31;
