//! Built-in operation and constant tables for CiA device profiles
//!
//! Loaded into a [`Device`] by [`Device::start`] based on the node's device
//! profile number. Currently the drives profile (CiA-402) is covered; other
//! profiles simply contribute nothing.

use std::sync::Arc;

use canmaster_common::Value;
use futures::FutureExt;

use crate::device::{Device, Operation, ReadAccessMethod, WriteAccessMethod};

/// Build an operation that writes a fixed controlword
fn controlword_op(word: u16) -> Operation {
    Arc::new(move |device: &Device, _arg: Value| {
        async move {
            device
                .set_entry("controlword", Value::U16(word), WriteAccessMethod::Sdo)
                .await?;
            Ok(Value::Invalid)
        }
        .boxed()
    })
}

/// The CiA-402 power state machine commands, as controlword values
mod controlwords {
    pub const SHUTDOWN: u16 = 0x0006;
    pub const SWITCH_ON: u16 = 0x0007;
    pub const ENABLE_OPERATION: u16 = 0x000F;
    pub const DISABLE_VOLTAGE: u16 = 0x0000;
    pub const QUICK_STOP: u16 = 0x0002;
    pub const FAULT_RESET: u16 = 0x0080;
}

fn cia402_operations() -> Vec<(&'static str, Operation)> {
    use controlwords::*;
    let mut ops: Vec<(&'static str, Operation)> = vec![
        ("shutdown", controlword_op(SHUTDOWN)),
        ("switch_on", controlword_op(SWITCH_ON)),
        ("disable_voltage", controlword_op(DISABLE_VOLTAGE)),
        ("quick_stop", controlword_op(QUICK_STOP)),
        ("fault_reset", controlword_op(FAULT_RESET)),
    ];

    // Walks the full power state machine up to Operation Enabled
    ops.push((
        "enable_operation",
        Arc::new(|device: &Device, _arg: Value| {
            async move {
                for word in [SHUTDOWN, SWITCH_ON, ENABLE_OPERATION] {
                    device
                        .set_entry("controlword", Value::U16(word), WriteAccessMethod::Sdo)
                        .await?;
                }
                Ok(Value::Invalid)
            }
            .boxed()
        }),
    ));

    ops.push((
        "get_statusword",
        Arc::new(|device: &Device, _arg: Value| {
            async move { device.get_entry("statusword", ReadAccessMethod::Sdo).await }.boxed()
        }),
    ));

    ops.push((
        "set_target_velocity",
        Arc::new(|device: &Device, arg: Value| {
            async move {
                device
                    .set_entry("target_velocity", arg, WriteAccessMethod::Sdo)
                    .await?;
                Ok(Value::Invalid)
            }
            .boxed()
        }),
    ));

    ops.push((
        "set_modes_of_operation",
        Arc::new(|device: &Device, arg: Value| {
            async move {
                device
                    .set_entry("modes_of_operation", arg, WriteAccessMethod::Sdo)
                    .await?;
                Ok(Value::Invalid)
            }
            .boxed()
        }),
    ));

    ops
}

fn cia402_constants() -> Vec<(&'static str, Value)> {
    use controlwords::*;
    vec![
        ("controlword_shutdown", Value::U16(SHUTDOWN)),
        ("controlword_switch_on", Value::U16(SWITCH_ON)),
        ("controlword_enable_operation", Value::U16(ENABLE_OPERATION)),
        ("controlword_disable_voltage", Value::U16(DISABLE_VOLTAGE)),
        ("controlword_quick_stop", Value::U16(QUICK_STOP)),
        ("controlword_fault_reset", Value::U16(FAULT_RESET)),
        ("profile_position_mode", Value::I8(1)),
        ("velocity_mode", Value::I8(2)),
        ("profile_velocity_mode", Value::I8(3)),
        ("torque_profile_mode", Value::I8(4)),
        ("homing_mode", Value::I8(6)),
        ("interpolated_position_mode", Value::I8(7)),
    ]
}

/// Operations contributed by a device profile
pub fn operations(profile: u16) -> Vec<(&'static str, Operation)> {
    match profile {
        402 => cia402_operations(),
        _ => Vec::new(),
    }
}

/// Constants contributed by a device profile
pub fn constants(profile: u16) -> Vec<(&'static str, Value)> {
    match profile {
        402 => cia402_constants(),
        _ => Vec::new(),
    }
}
