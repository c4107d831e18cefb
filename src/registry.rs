//! Device/tag registry
//!
//! The registry is an immutable snapshot swapped atomically on reload.
//! Readers clone an `Arc` and never block; a reload (SIGHUP or a config
//! notification on MQTT) re-reads the source, validates the whole set, and
//! swaps the pointer under the write lock. A snapshot that fails validation
//! is rejected wholesale and the previous one stays live.

use crate::adapters::{modbus, s7};
use crate::config::{Config, RegistrySource, MIN_POLL_INTERVAL_MS};
use crate::errors::RegistryError;
use crate::model::{
    is_valid_topic_fragment, is_valid_uns_prefix, ByteOrder, DataType, Device, Protocol, Tag,
};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Immutable device set owned by the protocol manager between reloads
#[derive(Debug, Default)]
pub struct Registry {
    devices: HashMap<String, Arc<Device>>,
}

impl Registry {
    pub fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Arc<Device>> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Enabled devices, the set the scheduler drives
    pub fn enabled_devices(&self) -> Vec<Arc<Device>> {
        let mut out: Vec<Arc<Device>> = self
            .devices
            .values()
            .filter(|d| d.enabled)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

/// Hot-swappable handle shared across components
#[derive(Clone, Default)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<Registry>>>,
}

impl SharedRegistry {
    pub fn new(registry: Registry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// Lock-free for practical purposes: one pointer clone under a read lock
    pub fn snapshot(&self) -> Arc<Registry> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    /// Atomically replace the live snapshot
    pub fn swap(&self, registry: Registry) {
        let mut guard = self.inner.write().expect("registry lock poisoned");
        *guard = Arc::new(registry);
    }
}

#[derive(Debug, Deserialize)]
struct DeviceFile {
    devices: Vec<Device>,
}

/// Load and validate the registry from the configured source
pub async fn load(config: &Config) -> Result<Registry, RegistryError> {
    let devices = match config.registry.source {
        RegistrySource::File => {
            let path = config
                .registry
                .file
                .as_deref()
                .ok_or_else(|| RegistryError::InvalidDevice("registry.file not set".into()))?;
            load_file(Path::new(path))?
        }
        RegistrySource::Database => load_database(&config.registry_database_url()).await?,
    };
    let registry = validate(devices, config.polling.default_interval_ms)?;
    info!(device_count = registry.len(), "Loaded device registry");
    Ok(registry)
}

/// Parse the YAML bootstrap file
pub fn load_file(path: &Path) -> Result<Vec<Device>, RegistryError> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: DeviceFile = serde_yaml::from_str(&raw)?;
    debug!(
        path = %path.display(),
        device_count = parsed.devices.len(),
        "Parsed device file"
    );
    Ok(parsed.devices)
}

/// Read devices and tags from the relational config tables
pub async fn load_database(url: &str) -> Result<Vec<Device>, RegistryError> {
    let pool = PgPoolOptions::new().max_connections(2).connect(url).await?;

    let device_rows = sqlx::query(
        r#"
        SELECT
            id, name, protocol, host, port, serial_port, baud_rate,
            endpoint_url, unit_id, rack, slot, security_mode, security_policy,
            username, password, enable_subscriptions, poll_interval_ms,
            uns_prefix, enabled, created_at, updated_at
        FROM devices
        ORDER BY id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut devices = Vec::with_capacity(device_rows.len());
    for row in device_rows {
        let id: String = row.get("id");
        let protocol_raw: String = row.get("protocol");
        let protocol = parse_protocol(&protocol_raw)
            .ok_or_else(|| RegistryError::InvalidDevice(format!("{id}: protocol {protocol_raw}")))?;

        let tag_rows = sqlx::query(
            r#"
            SELECT
                id, name, address, data_type, byte_order, scale, "offset",
                clamp_min, clamp_max, deadband_absolute, deadband_percent,
                unit, custom_topic, writable
            FROM tags
            WHERE device_id = $1
            ORDER BY id
            "#,
        )
        .bind(&id)
        .fetch_all(&pool)
        .await?;

        let mut tags = Vec::with_capacity(tag_rows.len());
        for trow in tag_rows {
            let tag_id: String = trow.get("id");
            let data_type_raw: String = trow.get("data_type");
            let data_type = parse_data_type(&data_type_raw).ok_or_else(|| {
                RegistryError::InvalidTag(format!("{id}/{tag_id}: data_type {data_type_raw}"))
            })?;
            let byte_order = trow
                .get::<Option<String>, _>("byte_order")
                .as_deref()
                .map(|s| {
                    parse_byte_order(s).ok_or_else(|| {
                        RegistryError::InvalidTag(format!("{id}/{tag_id}: byte_order {s}"))
                    })
                })
                .transpose()?;

            tags.push(Tag {
                id: tag_id,
                name: trow.get("name"),
                address: trow.get("address"),
                data_type,
                byte_order,
                scale: trow.get("scale"),
                offset: trow.get("offset"),
                clamp_min: trow.get("clamp_min"),
                clamp_max: trow.get("clamp_max"),
                deadband_absolute: trow.get("deadband_absolute"),
                deadband_percent: trow.get("deadband_percent"),
                unit: trow.get("unit"),
                custom_topic: trow.get("custom_topic"),
                writable: trow.get("writable"),
            });
        }

        devices.push(Device {
            id,
            name: row.get("name"),
            protocol,
            host: row.get("host"),
            port: row.get::<Option<i32>, _>("port").map(|p| p as u16),
            serial_port: row.get("serial_port"),
            baud_rate: row.get::<Option<i32>, _>("baud_rate").map(|b| b as u32),
            endpoint_url: row.get("endpoint_url"),
            unit_id: row.get::<Option<i16>, _>("unit_id").map(|u| u as u8),
            rack: row.get::<Option<i16>, _>("rack").map(|r| r as u16),
            slot: row.get::<Option<i16>, _>("slot").map(|s| s as u16),
            security_mode: row.get("security_mode"),
            security_policy: row.get("security_policy"),
            username: row.get("username"),
            password: row.get("password"),
            enable_subscriptions: row.get("enable_subscriptions"),
            poll_interval_ms: row.get::<i64, _>("poll_interval_ms") as u64,
            uns_prefix: row.get("uns_prefix"),
            enabled: row.get("enabled"),
            tags,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        });
    }

    pool.close().await;
    Ok(devices)
}

/// Validate the full device set; any error rejects the whole snapshot
pub fn validate(
    mut devices: Vec<Device>,
    default_interval_ms: u64,
) -> Result<Registry, RegistryError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    let mut map = HashMap::with_capacity(devices.len());

    for device in devices.drain(..) {
        if !ids.insert(device.id.clone()) {
            return Err(RegistryError::DuplicateId(device.id));
        }
        if !names.insert(device.name.clone()) {
            return Err(RegistryError::DuplicateId(format!(
                "device name {}",
                device.name
            )));
        }
        let device = validate_device(device, default_interval_ms)?;
        map.insert(device.id.clone(), Arc::new(device));
    }

    Ok(Registry { devices: map })
}

fn validate_device(mut device: Device, default_interval_ms: u64) -> Result<Device, RegistryError> {
    let id = device.id.clone();
    if !is_valid_topic_fragment(&id) {
        return Err(RegistryError::InvalidDevice(format!(
            "{id}: device id must be URL-safe"
        )));
    }
    if device.poll_interval_ms == 0 {
        device.poll_interval_ms = default_interval_ms;
    }
    if device.poll_interval_ms < MIN_POLL_INTERVAL_MS {
        return Err(RegistryError::InvalidDevice(format!(
            "{id}: poll interval {} ms is below the {} ms minimum",
            device.poll_interval_ms, MIN_POLL_INTERVAL_MS
        )));
    }
    if device.enabled && device.tags.is_empty() {
        return Err(RegistryError::InvalidDevice(format!(
            "{id}: enabled device has no tags"
        )));
    }

    match device.protocol {
        Protocol::ModbusTcp | Protocol::S7 => {
            if device.host.as_deref().unwrap_or("").is_empty() {
                return Err(RegistryError::InvalidDevice(format!("{id}: host not set")));
            }
        }
        Protocol::ModbusRtu => {
            if device.serial_port.as_deref().unwrap_or("").is_empty() {
                return Err(RegistryError::InvalidDevice(format!(
                    "{id}: serial_port not set"
                )));
            }
        }
        Protocol::Opcua => {
            if device.endpoint_url.as_deref().unwrap_or("").is_empty() {
                return Err(RegistryError::InvalidDevice(format!(
                    "{id}: endpoint_url not set"
                )));
            }
        }
    }

    let prefix_ok = is_valid_uns_prefix(&device.uns_prefix);
    let mut tag_ids = HashSet::new();
    let mut tag_names = HashSet::new();
    for tag in &device.tags {
        validate_tag(&id, device.protocol, tag)?;
        if !tag_ids.insert(tag.id.clone()) {
            return Err(RegistryError::DuplicateId(format!("{id}/{}", tag.id)));
        }
        if !tag_names.insert(tag.name.clone()) {
            return Err(RegistryError::DuplicateId(format!(
                "{id}: tag name {}",
                tag.name
            )));
        }
        // every published topic needs either a valid prefix or an override
        if tag.custom_topic.is_none() && !prefix_ok {
            return Err(RegistryError::InvalidDevice(format!(
                "{id}: uns_prefix {:?} invalid and tag {} has no custom topic",
                device.uns_prefix, tag.name
            )));
        }
    }

    Ok(device)
}

fn validate_tag(device_id: &str, protocol: Protocol, tag: &Tag) -> Result<(), RegistryError> {
    let ctx = format!("{device_id}/{}", tag.id);
    if !is_valid_topic_fragment(&tag.id) || !is_valid_topic_fragment(&tag.name) {
        return Err(RegistryError::InvalidTag(format!(
            "{ctx}: id and name must be URL-safe"
        )));
    }

    match protocol {
        Protocol::ModbusTcp | Protocol::ModbusRtu => {
            modbus::parse_address(&tag.address)
                .map_err(|e| RegistryError::InvalidTag(format!("{ctx}: {e}")))?;
            if tag.data_type == DataType::String {
                return Err(RegistryError::InvalidTag(format!(
                    "{ctx}: string tags are not register-addressable"
                )));
            }
        }
        Protocol::S7 => {
            s7::parse_address(&tag.address)
                .map_err(|e| RegistryError::InvalidTag(format!("{ctx}: {e}")))?;
            if tag.data_type == DataType::String {
                return Err(RegistryError::InvalidTag(format!(
                    "{ctx}: string tags are not supported on s7"
                )));
            }
        }
        Protocol::Opcua => {
            if tag.address.trim().is_empty() {
                return Err(RegistryError::InvalidTag(format!("{ctx}: empty node id")));
            }
        }
    }

    if !tag.data_type.is_numeric() {
        if tag.scale.is_some()
            || tag.offset.is_some()
            || tag.clamp_min.is_some()
            || tag.clamp_max.is_some()
        {
            return Err(RegistryError::InvalidTag(format!(
                "{ctx}: scaling/clamping not applicable to {:?} tags",
                tag.data_type
            )));
        }
    }
    if let Some(scale) = tag.scale {
        if scale == 0.0 {
            return Err(RegistryError::InvalidTag(format!("{ctx}: scale is zero")));
        }
    }
    if tag.deadband_absolute.is_some() && tag.deadband_percent.is_some() {
        return Err(RegistryError::InvalidTag(format!(
            "{ctx}: deadband_absolute and deadband_percent are mutually exclusive"
        )));
    }
    if let Some(topic) = &tag.custom_topic {
        if !is_valid_uns_prefix(topic) {
            return Err(RegistryError::InvalidTag(format!(
                "{ctx}: custom topic {topic:?} invalid"
            )));
        }
    }
    if let (Some(min), Some(max)) = (tag.clamp_min, tag.clamp_max) {
        if min > max {
            return Err(RegistryError::InvalidTag(format!(
                "{ctx}: clamp_min above clamp_max"
            )));
        }
    }
    Ok(())
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
        "modbus-tcp" | "modbustcp" => Some(Protocol::ModbusTcp),
        "modbus-rtu" | "modbusrtu" => Some(Protocol::ModbusRtu),
        "opcua" | "opc-ua" => Some(Protocol::Opcua),
        "s7" => Some(Protocol::S7),
        _ => None,
    }
}

fn parse_data_type(s: &str) -> Option<DataType> {
    match s.to_ascii_lowercase().as_str() {
        "bool" => Some(DataType::Bool),
        "int16" => Some(DataType::Int16),
        "int32" => Some(DataType::Int32),
        "int64" => Some(DataType::Int64),
        "uint16" => Some(DataType::Uint16),
        "uint32" => Some(DataType::Uint32),
        "uint64" => Some(DataType::Uint64),
        "float32" => Some(DataType::Float32),
        "float64" => Some(DataType::Float64),
        "string" => Some(DataType::String),
        _ => None,
    }
}

fn parse_byte_order(s: &str) -> Option<ByteOrder> {
    match s.to_ascii_lowercase().replace('_', "-").as_str() {
        "big-endian" => Some(ByteOrder::BigEndian),
        "little-endian" => Some(ByteOrder::LittleEndian),
        "big-endian-word-swap" => Some(ByteOrder::BigEndianWordSwap),
        "little-endian-word-swap" => Some(ByteOrder::LittleEndianWordSwap),
        _ => None,
    }
}

/// Reload the registry and swap it in; logs and keeps the old snapshot on
/// failure
pub async fn reload(config: &Config, shared: &SharedRegistry) {
    match load(config).await {
        Ok(registry) => {
            let count = registry.len();
            shared.swap(registry);
            info!(device_count = count, "Registry reloaded");
        }
        Err(e) => {
            warn!(error = %e, "Registry reload failed, keeping previous snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> Device {
        Device {
            id: id.to_string(),
            name: format!("Device {id}"),
            protocol: Protocol::ModbusTcp,
            host: Some("10.0.0.5".to_string()),
            port: Some(502),
            serial_port: None,
            baud_rate: None,
            endpoint_url: None,
            unit_id: Some(1),
            rack: None,
            slot: None,
            security_mode: None,
            security_policy: None,
            username: None,
            password: None,
            enable_subscriptions: false,
            poll_interval_ms: 1000,
            uns_prefix: "plant1/line2/plc1".to_string(),
            enabled: true,
            tags: vec![tag("t1", "Temperature", "40001")],
            created_at: None,
            updated_at: None,
        }
    }

    fn tag(id: &str, name: &str, address: &str) -> Tag {
        Tag {
            id: id.to_string(),
            name: name.to_string(),
            address: address.to_string(),
            data_type: DataType::Uint16,
            byte_order: None,
            scale: None,
            offset: None,
            clamp_min: None,
            clamp_max: None,
            deadband_absolute: None,
            deadband_percent: None,
            unit: None,
            custom_topic: None,
            writable: false,
        }
    }

    #[test]
    fn test_valid_device_accepted() {
        let registry = validate(vec![device("plc-001")], 1000).unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.contains("plc-001"));
    }

    #[test]
    fn test_duplicate_device_id_rejected() {
        let result = validate(vec![device("plc-001"), device("plc-001")], 1000);
        assert!(matches!(result, Err(RegistryError::DuplicateId(_))));
    }

    #[test]
    fn test_short_poll_interval_rejected() {
        let mut d = device("plc-001");
        d.poll_interval_ms = 50;
        assert!(validate(vec![d], 1000).is_err());
    }

    #[test]
    fn test_zero_interval_takes_default() {
        let mut d = device("plc-001");
        d.poll_interval_ms = 0;
        let registry = validate(vec![d], 2500).unwrap();
        assert_eq!(
            registry.device("plc-001").unwrap().poll_interval_ms,
            2500
        );
    }

    #[test]
    fn test_enabled_device_needs_tags() {
        let mut d = device("plc-001");
        d.tags.clear();
        assert!(validate(vec![d], 1000).is_err());

        let mut d = device("plc-002");
        d.tags.clear();
        d.enabled = false;
        assert!(validate(vec![d], 1000).is_ok());
    }

    #[test]
    fn test_bad_uns_prefix_rejected_without_custom_topic() {
        let mut d = device("plc-001");
        d.uns_prefix = "/leading/slash".to_string();
        assert!(validate(vec![d], 1000).is_err());

        let mut d = device("plc-002");
        d.uns_prefix = String::new();
        d.tags[0].custom_topic = Some("legacy/temp".to_string());
        assert!(validate(vec![d], 1000).is_ok());
    }

    #[test]
    fn test_scaling_rejected_for_string_tag() {
        let mut d = device("plc-001");
        d.tags[0].data_type = DataType::String;
        d.tags[0].address = "40010".to_string();
        d.tags[0].scale = Some(0.1);
        assert!(validate(vec![d], 1000).is_err());
    }

    #[test]
    fn test_deadband_mutual_exclusion() {
        let mut d = device("plc-001");
        d.tags[0].deadband_absolute = Some(0.5);
        d.tags[0].deadband_percent = Some(1.0);
        assert!(validate(vec![d], 1000).is_err());
    }

    #[test]
    fn test_bad_modbus_address_rejected() {
        let mut d = device("plc-001");
        d.tags[0].address = "not-an-address".to_string();
        assert!(validate(vec![d], 1000).is_err());
    }

    #[test]
    fn test_duplicate_tag_name_rejected() {
        let mut d = device("plc-001");
        d.tags.push(tag("t2", "Temperature", "40002"));
        assert!(validate(vec![d], 1000).is_err());
    }

    #[test]
    fn test_snapshot_swap() {
        let shared = SharedRegistry::new(validate(vec![device("plc-001")], 1000).unwrap());
        let before = shared.snapshot();
        assert!(before.contains("plc-001"));

        shared.swap(validate(vec![device("plc-002")], 1000).unwrap());
        let after = shared.snapshot();
        assert!(!after.contains("plc-001"));
        assert!(after.contains("plc-002"));
        // old snapshot still usable by in-flight readers
        assert!(before.contains("plc-001"));
    }
}
