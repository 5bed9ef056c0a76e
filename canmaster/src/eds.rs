//! EDS file reading and the built-in CiA dictionary library
//!
//! An EDS file is an ini document whose sections are object indexes
//! (`[1000]`, `[1A00sub1]`). Variable sections become dictionary entries;
//! array and record parent sections contribute a name prefix for their sub
//! entries. Loading behavior is controlled by an explicit [`LoadOptions`]
//! passed to each call.

use std::path::{Path, PathBuf};

use canmaster_common::{AccessType, DataType, Value};
use ini::{Ini, Properties};
use lazy_static::lazy_static;
use num_traits::Num;
use regex::Regex;
use snafu::{OptionExt, ResultExt, Snafu};

use crate::object_dict::{Address, Entry, ObjectDictionary};

/// Options controlling one dictionary load
///
/// Replaces process-wide configuration flags: every load names its own
/// behavior.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoadOptions {
    /// Remove all existing entries and names before loading
    pub clear_dictionary: bool,
    /// Name-only merge: where an address already exists, only add this
    /// file's name for it to the name index instead of replacing the entry
    pub just_add_names: bool,
    /// Flag entries added by this load as generic (profile-derived rather
    /// than device-specific)
    pub mark_generic: bool,
}

/// Errors raised while loading an EDS file
#[derive(Debug, Snafu)]
pub enum EdsError {
    /// The file could not be read
    #[snafu(display("Failed to read EDS file {}: {source}", path.display()))]
    FileRead {
        /// Path of the file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },
    /// The content is not a parseable ini document
    #[snafu(display("Could not parse EDS content: {source}"))]
    Parse {
        /// Underlying parse error
        source: ini::ParseError,
    },
    /// A variable section is missing a required property
    #[snafu(display("EDS section [{section}] is missing property {property}"))]
    MissingProperty {
        /// The offending section
        section: String,
        /// The missing property name
        property: String,
    },
    /// A property value could not be interpreted
    #[snafu(display("EDS section [{section}] has a bad {property} value: \"{value}\""))]
    BadValue {
        /// The offending section
        section: String,
        /// The property name
        property: String,
        /// The uninterpretable value
        value: String,
    },
}

lazy_static! {
    static ref RE_SECTION: Regex =
        Regex::new(r"^([0-9A-Fa-f]{4})(?:sub([0-9A-Fa-f]{1,2}))?$").unwrap();
}

/// Parse an EDS integer, which may be decimal or 0x-prefixed hex
fn eds_int<N: Num>(s: &str) -> Result<N, N::FromStrRadixErr> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        N::from_str_radix(hex, 16)
    } else {
        N::from_str_radix(s, 10)
    }
}

/// Parse a section name into (index, subindex)
fn parse_section(section: &str) -> Option<(u16, Option<u8>)> {
    let caps = RE_SECTION.captures(section)?;
    let index = u16::from_str_radix(caps.get(1)?.as_str(), 16).ok()?;
    let sub = match caps.get(2) {
        Some(m) => Some(u8::from_str_radix(m.as_str(), 16).ok()?),
        None => None,
    };
    Some((index, sub))
}

/// Best-effort parse of a DefaultValue string
///
/// EDS files routinely carry expressions like `$NODEID+0x180` here; those
/// (and anything else unparseable) yield no default rather than an error.
fn parse_default(data_type: DataType, raw: &str) -> Option<Value> {
    let raw = raw.trim();
    if raw.is_empty() || raw.contains('$') {
        return None;
    }
    let value = match data_type {
        DataType::Bool => Value::Bool(eds_int::<u8>(raw).ok()? != 0),
        DataType::I8 => Value::I8(eds_int(raw).ok()?),
        DataType::I16 => Value::I16(eds_int(raw).ok()?),
        DataType::I32 => Value::I32(eds_int(raw).ok()?),
        DataType::I64 => Value::I64(eds_int(raw).ok()?),
        DataType::U8 => Value::U8(eds_int(raw).ok()?),
        DataType::U16 => Value::U16(eds_int(raw).ok()?),
        DataType::U32 => Value::U32(eds_int(raw).ok()?),
        DataType::U64 => Value::U64(eds_int(raw).ok()?),
        DataType::F32 => Value::F32(raw.parse().ok()?),
        DataType::F64 => Value::F64(raw.parse().ok()?),
        DataType::VisibleString => Value::VisibleString(raw.to_owned()),
        DataType::OctetString => return None,
    };
    Some(value)
}

fn get_prop<'a>(
    props: &'a Properties,
    section: &str,
    property: &'static str,
) -> Result<&'a str, EdsError> {
    props.get(property).context(MissingPropertySnafu {
        section,
        property,
    })
}

/// Build one dictionary entry from a variable section
fn entry_from_section(
    address: Address,
    name: String,
    section: &str,
    props: &Properties,
) -> Result<Entry, EdsError> {
    let type_raw = get_prop(props, section, "DataType")?;
    let type_code: u16 = eds_int(type_raw).map_err(|_| {
        BadValueSnafu {
            section,
            property: "DataType",
            value: type_raw,
        }
        .build()
    })?;
    let data_type = DataType::try_from(type_code).map_err(|_| {
        BadValueSnafu {
            section,
            property: "DataType",
            value: type_raw,
        }
        .build()
    })?;

    let access_raw = get_prop(props, section, "AccessType")?;
    let access_type = AccessType::try_from(access_raw).map_err(|_| {
        BadValueSnafu {
            section,
            property: "AccessType",
            value: access_raw,
        }
        .build()
    })?;

    let mut entry = Entry::new(address, &name, data_type, access_type);
    if let Some(default) = props
        .get("DefaultValue")
        .and_then(|raw| parse_default(data_type, raw))
    {
        entry = entry.with_default_value(default);
    }
    Ok(entry)
}

/// Load dictionary entries from an EDS file on disk
///
/// Returns the number of entries imported (or names added, in name-only
/// mode).
pub fn load_eds_file(
    dict: &ObjectDictionary,
    path: impl AsRef<Path>,
    options: &LoadOptions,
) -> Result<usize, EdsError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).context(FileReadSnafu { path })?;
    load_eds_str(dict, &content, options)
}

/// Load dictionary entries from EDS content
pub fn load_eds_str(
    dict: &ObjectDictionary,
    content: &str,
    options: &LoadOptions,
) -> Result<usize, EdsError> {
    let ini = Ini::load_from_str(content).context(ParseSnafu)?;

    if options.clear_dictionary {
        dict.clear();
    }

    // First pass: remember parent section names so sub entries can be
    // qualified ("identity object" + "vendor id" -> identity_object_vendor_id)
    let mut parent_names: std::collections::HashMap<u16, String> = std::collections::HashMap::new();
    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        if let Some((index, None)) = parse_section(section) {
            if props.get("DataType").is_none() {
                if let Some(name) = props.get("ParameterName") {
                    parent_names.insert(index, name.to_owned());
                }
            }
        }
    }

    let mut imported = 0;
    for (section, props) in ini.iter() {
        let Some(section) = section else { continue };
        let Some((index, sub)) = parse_section(section) else {
            continue;
        };
        // Only variable sections carry a DataType; array/record parents were
        // handled in the first pass
        if props.get("DataType").is_none() {
            continue;
        }
        let address = Address::new(index, sub.unwrap_or(0));
        let raw_name = get_prop(props, section, "ParameterName")?;
        let name = match (sub, parent_names.get(&index)) {
            (Some(_), Some(parent)) => format!("{parent} {raw_name}"),
            _ => raw_name.to_owned(),
        };

        if options.just_add_names && dict.contains(address) {
            match dict.add_name_alias(&name, address) {
                Ok(()) => imported += 1,
                Err(e) => log::debug!("Skipping EDS name \"{name}\" for {address}: {e}"),
            }
            continue;
        }

        let entry = entry_from_section(address, name, section, props)?;
        let name = entry.name().to_owned();
        match dict.insert(entry) {
            Ok(entry) => {
                entry.set_generic(options.mark_generic);
                imported += 1;
            }
            Err(e) => {
                log::warn!("Skipping EDS entry \"{name}\" at {address}: {e}");
            }
        }
    }
    Ok(imported)
}

/// Built-in dictionaries for the CiA standard profiles
///
/// Stands in for an on-disk EDS library: the communication-profile (CiA-301)
/// entries and the drives-profile (CiA-402) entries ship with the crate.
pub mod library {
    use super::*;

    /// The bare minimum dictionary: device type and error register
    pub const MANDATORY_EDS: &str = "\
[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[1001]
ParameterName=Error register
ObjectType=0x7
DataType=0x0005
AccessType=ro
PDOMapping=0
";

    /// Communication-profile entries common to every CANopen device
    pub const CIA_301_EDS: &str = "\
[1000]
ParameterName=Device type
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[1001]
ParameterName=Error register
ObjectType=0x7
DataType=0x0005
AccessType=ro
PDOMapping=0

[1008]
ParameterName=Manufacturer device name
ObjectType=0x7
DataType=0x0009
AccessType=const
PDOMapping=0

[1009]
ParameterName=Manufacturer hardware version
ObjectType=0x7
DataType=0x0009
AccessType=const
PDOMapping=0

[100A]
ParameterName=Manufacturer software version
ObjectType=0x7
DataType=0x0009
AccessType=const
PDOMapping=0

[1017]
ParameterName=Producer heartbeat time
ObjectType=0x7
DataType=0x0006
AccessType=rw
DefaultValue=0
PDOMapping=0

[1018]
ParameterName=Identity object
ObjectType=0x9
SubNumber=5

[1018sub0]
ParameterName=Number of entries
ObjectType=0x7
DataType=0x0005
AccessType=ro
DefaultValue=4
PDOMapping=0

[1018sub1]
ParameterName=Vendor id
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[1018sub2]
ParameterName=Product code
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[1018sub3]
ParameterName=Revision number
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0

[1018sub4]
ParameterName=Serial number
ObjectType=0x7
DataType=0x0007
AccessType=ro
PDOMapping=0
";

    /// Drives-and-motion-profile (CiA-402) entries
    pub const CIA_402_EDS: &str = "\
[603F]
ParameterName=Error code
ObjectType=0x7
DataType=0x0006
AccessType=ro
PDOMapping=1

[6040]
ParameterName=Controlword
ObjectType=0x7
DataType=0x0006
AccessType=rw
DefaultValue=0
PDOMapping=1

[6041]
ParameterName=Statusword
ObjectType=0x7
DataType=0x0006
AccessType=ro
PDOMapping=1

[6042]
ParameterName=Vl target velocity
ObjectType=0x7
DataType=0x0003
AccessType=rw
DefaultValue=0
PDOMapping=1

[6060]
ParameterName=Modes of operation
ObjectType=0x7
DataType=0x0002
AccessType=rw
PDOMapping=1

[6061]
ParameterName=Modes of operation display
ObjectType=0x7
DataType=0x0002
AccessType=ro
PDOMapping=1

[6064]
ParameterName=Position actual value
ObjectType=0x7
DataType=0x0004
AccessType=ro
PDOMapping=1

[606C]
ParameterName=Velocity actual value
ObjectType=0x7
DataType=0x0004
AccessType=ro
PDOMapping=1

[607A]
ParameterName=Target position
ObjectType=0x7
DataType=0x0004
AccessType=rw
PDOMapping=1

[6081]
ParameterName=Profile velocity
ObjectType=0x7
DataType=0x0007
AccessType=rw
PDOMapping=1

[60FF]
ParameterName=Target velocity
ObjectType=0x7
DataType=0x0004
AccessType=rw
PDOMapping=1
";

    /// Load the mandatory CiA-301 entries (at minimum the device type)
    pub fn load_mandatory_entries(
        dict: &ObjectDictionary,
        options: &LoadOptions,
    ) -> Result<usize, EdsError> {
        load_eds_str(dict, MANDATORY_EDS, options)
    }

    /// Load the built-in dictionary for a device profile
    ///
    /// Returns false when no dictionary for the profile is available; the
    /// caller should fall back to [`load_mandatory_entries`].
    pub fn load_default_eds(
        dict: &ObjectDictionary,
        profile: u16,
        options: &LoadOptions,
    ) -> Result<bool, EdsError> {
        let profile_eds = match profile {
            402 => CIA_402_EDS,
            _ => return Ok(false),
        };
        load_eds_str(dict, CIA_301_EDS, options)?;
        load_eds_str(dict, profile_eds, options)?;
        Ok(true)
    }
}
