//! Object dictionary data types and typed values

/// Data types for dictionary objects, per the CiA-301 type index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    /// BOOLEAN
    Bool,
    /// INTEGER8
    I8,
    /// INTEGER16
    I16,
    /// INTEGER32
    I32,
    /// INTEGER64
    I64,
    /// UNSIGNED8
    U8,
    /// UNSIGNED16
    U16,
    /// UNSIGNED32
    U32,
    /// UNSIGNED64
    U64,
    /// REAL32
    F32,
    /// REAL64
    F64,
    /// VISIBLE_STRING
    VisibleString,
    /// OCTET_STRING
    OctetString,
}

/// Error for [`DataType::try_from`] on an unknown type index
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnknownDataType(pub u16);

impl std::fmt::Display for UnknownDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown object data type 0x{:04X}", self.0)
    }
}

impl std::error::Error for UnknownDataType {}

impl TryFrom<u16> for DataType {
    type Error = UnknownDataType;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(DataType::Bool),
            0x0002 => Ok(DataType::I8),
            0x0003 => Ok(DataType::I16),
            0x0004 => Ok(DataType::I32),
            0x0005 => Ok(DataType::U8),
            0x0006 => Ok(DataType::U16),
            0x0007 => Ok(DataType::U32),
            0x0008 => Ok(DataType::F32),
            0x0009 => Ok(DataType::VisibleString),
            0x000A => Ok(DataType::OctetString),
            0x0011 => Ok(DataType::F64),
            0x0015 => Ok(DataType::I64),
            0x001B => Ok(DataType::U64),
            _ => Err(UnknownDataType(value)),
        }
    }
}

impl DataType {
    /// The fixed byte width of the type, or `None` for string types
    pub fn size(&self) -> Option<usize> {
        match self {
            DataType::Bool | DataType::I8 | DataType::U8 => Some(1),
            DataType::I16 | DataType::U16 => Some(2),
            DataType::I32 | DataType::U32 | DataType::F32 => Some(4),
            DataType::I64 | DataType::U64 | DataType::F64 => Some(8),
            DataType::VisibleString | DataType::OctetString => None,
        }
    }
}

/// Access rights of a dictionary object
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessType {
    /// Object can only be read
    ReadOnly,
    /// Object can only be written
    WriteOnly,
    /// Object can be read and written
    ReadWrite,
    /// Object is constant; reads always yield the same value
    Const,
}

impl AccessType {
    /// True if the object may be read
    pub fn readable(&self) -> bool {
        !matches!(self, AccessType::WriteOnly)
    }

    /// True if the object may be written
    pub fn writable(&self) -> bool {
        matches!(self, AccessType::WriteOnly | AccessType::ReadWrite)
    }
}

/// Error for [`AccessType::try_from`] on an unknown access string
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownAccessType(pub String);

impl TryFrom<&str> for AccessType {
    type Error = UnknownAccessType;

    /// Parse an EDS access type string
    ///
    /// `rww` and `rwr` are PDO-direction refinements of `rw` and map to
    /// [`AccessType::ReadWrite`].
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.to_ascii_lowercase().as_str() {
            "ro" => Ok(AccessType::ReadOnly),
            "wo" => Ok(AccessType::WriteOnly),
            "rw" | "rww" | "rwr" => Ok(AccessType::ReadWrite),
            "const" => Ok(AccessType::Const),
            _ => Err(UnknownAccessType(value.to_owned())),
        }
    }
}

/// Error produced when constructing or converting a [`Value`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ValueError {
    /// The byte payload width does not match the data type
    WidthMismatch {
        /// The data type a value was constructed for
        data_type: DataType,
        /// The payload length actually supplied
        len: usize,
    },
    /// The value holds a different type than requested
    TypeMismatch,
    /// The value is invalid (never updated)
    Invalid,
}

impl std::fmt::Display for ValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueError::WidthMismatch { data_type, len } => {
                write!(f, "{len} bytes cannot represent a {data_type:?}")
            }
            ValueError::TypeMismatch => write!(f, "value has a different type"),
            ValueError::Invalid => write!(f, "value is invalid"),
        }
    }
}

impl std::error::Error for ValueError {}

/// A typed object value
///
/// `Invalid` is the state of a dictionary entry before its first successful
/// read or PDO update.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// No value has been assigned yet
    Invalid,
    /// BOOLEAN value
    Bool(bool),
    /// INTEGER8 value
    I8(i8),
    /// INTEGER16 value
    I16(i16),
    /// INTEGER32 value
    I32(i32),
    /// INTEGER64 value
    I64(i64),
    /// UNSIGNED8 value
    U8(u8),
    /// UNSIGNED16 value
    U16(u16),
    /// UNSIGNED32 value
    U32(u32),
    /// UNSIGNED64 value
    U64(u64),
    /// REAL32 value
    F32(f32),
    /// REAL64 value
    F64(f64),
    /// VISIBLE_STRING value
    VisibleString(String),
    /// OCTET_STRING value
    OctetString(Vec<u8>),
}

impl Value {
    /// The data type of this value, or `None` if it is invalid
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Invalid => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::I8(_) => Some(DataType::I8),
            Value::I16(_) => Some(DataType::I16),
            Value::I32(_) => Some(DataType::I32),
            Value::I64(_) => Some(DataType::I64),
            Value::U8(_) => Some(DataType::U8),
            Value::U16(_) => Some(DataType::U16),
            Value::U32(_) => Some(DataType::U32),
            Value::U64(_) => Some(DataType::U64),
            Value::F32(_) => Some(DataType::F32),
            Value::F64(_) => Some(DataType::F64),
            Value::VisibleString(_) => Some(DataType::VisibleString),
            Value::OctetString(_) => Some(DataType::OctetString),
        }
    }

    /// True before the first assignment
    pub fn is_invalid(&self) -> bool {
        matches!(self, Value::Invalid)
    }

    /// Construct a value of `data_type` from a little-endian byte payload
    ///
    /// The payload length must match the type width exactly; string types
    /// accept any length.
    pub fn from_bytes(data_type: DataType, bytes: &[u8]) -> Result<Self, ValueError> {
        if let Some(size) = data_type.size() {
            if bytes.len() != size {
                return Err(ValueError::WidthMismatch {
                    data_type,
                    len: bytes.len(),
                });
            }
        }
        let value = match data_type {
            DataType::Bool => Value::Bool(bytes[0] != 0),
            DataType::I8 => Value::I8(bytes[0] as i8),
            DataType::I16 => Value::I16(i16::from_le_bytes(bytes.try_into().unwrap())),
            DataType::I32 => Value::I32(i32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::I64 => Value::I64(i64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::U8 => Value::U8(bytes[0]),
            DataType::U16 => Value::U16(u16::from_le_bytes(bytes.try_into().unwrap())),
            DataType::U32 => Value::U32(u32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::U64 => Value::U64(u64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::F32 => Value::F32(f32::from_le_bytes(bytes.try_into().unwrap())),
            DataType::F64 => Value::F64(f64::from_le_bytes(bytes.try_into().unwrap())),
            DataType::VisibleString => {
                // Strip trailing NUL padding some servers append
                let end = bytes
                    .iter()
                    .rposition(|b| *b != 0)
                    .map(|p| p + 1)
                    .unwrap_or(0);
                Value::VisibleString(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            DataType::OctetString => Value::OctetString(bytes.to_vec()),
        };
        Ok(value)
    }

    /// Encode the value as a little-endian byte payload
    ///
    /// An invalid value encodes as an empty payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Invalid => Vec::new(),
            Value::Bool(v) => vec![*v as u8],
            Value::I8(v) => vec![*v as u8],
            Value::I16(v) => v.to_le_bytes().to_vec(),
            Value::I32(v) => v.to_le_bytes().to_vec(),
            Value::I64(v) => v.to_le_bytes().to_vec(),
            Value::U8(v) => vec![*v],
            Value::U16(v) => v.to_le_bytes().to_vec(),
            Value::U32(v) => v.to_le_bytes().to_vec(),
            Value::U64(v) => v.to_le_bytes().to_vec(),
            Value::F32(v) => v.to_le_bytes().to_vec(),
            Value::F64(v) => v.to_le_bytes().to_vec(),
            Value::VisibleString(v) => v.as_bytes().to_vec(),
            Value::OctetString(v) => v.clone(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Invalid => write!(f, "<invalid>"),
            Value::Bool(v) => write!(f, "{v}"),
            Value::I8(v) => write!(f, "{v}"),
            Value::I16(v) => write!(f, "{v}"),
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::U8(v) => write!(f, "{v}"),
            Value::U16(v) => write!(f, "{v}"),
            Value::U32(v) => write!(f, "{v}"),
            Value::U64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::VisibleString(v) => write!(f, "{v:?}"),
            Value::OctetString(v) => {
                for b in v {
                    write!(f, "{b:02X}")?;
                }
                Ok(())
            }
        }
    }
}

macro_rules! value_conversions {
    ($($variant:ident: $prim:ty),* $(,)?) => {
        $(
            impl From<$prim> for Value {
                fn from(value: $prim) -> Self {
                    Value::$variant(value)
                }
            }

            impl TryFrom<&Value> for $prim {
                type Error = ValueError;

                fn try_from(value: &Value) -> Result<Self, Self::Error> {
                    match value {
                        Value::$variant(v) => Ok(v.clone()),
                        Value::Invalid => Err(ValueError::Invalid),
                        _ => Err(ValueError::TypeMismatch),
                    }
                }
            }
        )*
    };
}

value_conversions!(
    Bool: bool,
    I8: i8,
    I16: i16,
    I32: i32,
    I64: i64,
    U8: u8,
    U16: u16,
    U32: u32,
    U64: u64,
    F32: f32,
    F64: f64,
    VisibleString: String,
    OctetString: Vec<u8>,
);

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::VisibleString(value.to_owned())
    }
}
