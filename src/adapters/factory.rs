//! Adapter factory keyed by the device's protocol

use super::modbus::ModbusAdapter;
use super::opcua::OpcuaAdapter;
use super::s7::S7Adapter;
use super::{ProtocolAdapter, ProtocolError};
use crate::config::Config;
use crate::model::{Device, Protocol};
use crate::point_pool::PointPool;
use std::sync::Arc;
use tracing::debug;

/// Create a disconnected adapter instance for a device
pub fn create_adapter(
    device: Arc<Device>,
    config: &Config,
    points: Arc<PointPool>,
) -> Result<Box<dyn ProtocolAdapter>, ProtocolError> {
    debug!(device_id = %device.id, protocol = %device.protocol, "Creating protocol adapter");
    Ok(match device.protocol {
        Protocol::ModbusTcp | Protocol::ModbusRtu => {
            Box::new(ModbusAdapter::new(device, config.modbus.clone(), points)?)
        }
        Protocol::Opcua => Box::new(OpcuaAdapter::new(device, config.opcua.clone(), points)),
        Protocol::S7 => Box::new(S7Adapter::new(device, config.s7.clone(), points)),
    })
}
