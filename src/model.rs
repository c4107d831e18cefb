//! Core data model shared by the gateway and ingestion services
//!
//! Everything that crosses a component boundary lives here: devices and their
//! tags, the normalized `DataPoint` record, typed write values, and the JSON
//! wire payload published on the unified namespace.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Wire protocol a device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    ModbusTcp,
    ModbusRtu,
    Opcua,
    S7,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::ModbusTcp => write!(f, "modbus-tcp"),
            Protocol::ModbusRtu => write!(f, "modbus-rtu"),
            Protocol::Opcua => write!(f, "opcua"),
            Protocol::S7 => write!(f, "s7"),
        }
    }
}

/// Tag value type as declared in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int16,
    Int32,
    Int64,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
    String,
}

impl DataType {
    /// Number of 16-bit registers needed to hold one value
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
            DataType::Int64 | DataType::Uint64 | DataType::Float64 => 4,
            // String tags are not register-addressable; callers reject them earlier
            DataType::String => 0,
        }
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::Bool | DataType::String)
    }
}

/// Byte order for multi-register numerics
///
/// Registers arrive big-endian per word on the wire; the order controls how
/// words and bytes are assembled into the final value. `BigEndianWordSwap` is
/// the common "mid-endian" PLC layout (CDAB).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByteOrder {
    BigEndian,
    LittleEndian,
    BigEndianWordSwap,
    LittleEndianWordSwap,
}

impl Default for ByteOrder {
    fn default() -> Self {
        ByteOrder::BigEndian
    }
}

impl ByteOrder {
    /// Assemble raw wire registers into a canonical big-endian byte buffer
    pub fn registers_to_bytes(&self, regs: &[u16]) -> Vec<u8> {
        let mut out = Vec::with_capacity(regs.len() * 2);
        match self {
            ByteOrder::BigEndian => {
                for r in regs {
                    out.extend_from_slice(&r.to_be_bytes());
                }
            }
            ByteOrder::LittleEndian => {
                for r in regs.iter().rev() {
                    out.extend_from_slice(&r.to_le_bytes());
                }
            }
            ByteOrder::BigEndianWordSwap => {
                for r in regs.iter().rev() {
                    out.extend_from_slice(&r.to_be_bytes());
                }
            }
            ByteOrder::LittleEndianWordSwap => {
                for r in regs {
                    out.extend_from_slice(&r.to_le_bytes());
                }
            }
        }
        out
    }

    /// Split a canonical big-endian byte buffer into wire registers; inverse
    /// of [`registers_to_bytes`](Self::registers_to_bytes)
    pub fn bytes_to_registers(&self, bytes: &[u8]) -> Vec<u16> {
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        match self {
            ByteOrder::BigEndian => words,
            ByteOrder::LittleEndian => words
                .iter()
                .rev()
                .map(|w| u16::from_le_bytes(w.to_be_bytes()))
                .collect(),
            ByteOrder::BigEndianWordSwap => words.into_iter().rev().collect(),
            ByteOrder::LittleEndianWordSwap => words
                .iter()
                .map(|w| u16::from_le_bytes(w.to_be_bytes()))
                .collect(),
        }
    }
}

/// OPC-UA-derived data quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Good,
    Bad,
    Uncertain,
    Stale,
    NotConnected,
}

impl Default for Quality {
    fn default() -> Self {
        Quality::Bad
    }
}

impl Quality {
    /// SMALLINT code stored in the `metrics.quality` column
    pub fn code(&self) -> i16 {
        match self {
            Quality::Good => 0,
            Quality::Bad => 1,
            Quality::Uncertain => 2,
            Quality::Stale => 3,
            Quality::NotConnected => 4,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Good => write!(f, "good"),
            Quality::Bad => write!(f, "bad"),
            Quality::Uncertain => write!(f, "uncertain"),
            Quality::Stale => write!(f, "stale"),
            Quality::NotConnected => write!(f, "not_connected"),
        }
    }
}

/// An addressable data point on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    /// Unique within the owning device; becomes the topic leaf
    pub name: String,
    /// Protocol-specific address string
    pub address: String,
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: Option<ByteOrder>,
    /// Linear scaling factor `a` in `engineering = raw * a + offset`
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub clamp_min: Option<f64>,
    #[serde(default)]
    pub clamp_max: Option<f64>,
    #[serde(default)]
    pub deadband_absolute: Option<f64>,
    #[serde(default)]
    pub deadband_percent: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    /// Absolute topic override; when set, the device UNS prefix is ignored
    #[serde(default)]
    pub custom_topic: Option<String>,
    #[serde(default)]
    pub writable: bool,
}

impl Tag {
    /// Convert a raw device value to engineering units (scale, then clamp)
    pub fn scale_value(&self, raw: f64) -> f64 {
        if !self.data_type.is_numeric() {
            return raw;
        }
        let mut v = raw * self.scale.unwrap_or(1.0) + self.offset.unwrap_or(0.0);
        if let Some(min) = self.clamp_min {
            v = v.max(min);
        }
        if let Some(max) = self.clamp_max {
            v = v.min(max);
        }
        v
    }

    /// Reverse scaling before encoding a write
    pub fn unscale_value(&self, engineering: f64) -> f64 {
        if !self.data_type.is_numeric() {
            return engineering;
        }
        (engineering - self.offset.unwrap_or(0.0)) / self.scale.unwrap_or(1.0)
    }

    /// Topic this tag publishes on
    pub fn topic(&self, uns_prefix: &str) -> String {
        match &self.custom_topic {
            Some(t) => t.clone(),
            None => format!("{}/{}", uns_prefix, self.name),
        }
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order.unwrap_or_default()
    }
}

/// A polled industrial device bound to exactly one protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Serial device path for Modbus RTU
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub baud_rate: Option<u32>,
    /// Full endpoint URL for OPC UA (`opc.tcp://...`)
    #[serde(default)]
    pub endpoint_url: Option<String>,
    /// Modbus unit / slave id
    #[serde(default)]
    pub unit_id: Option<u8>,
    /// S7 rack and slot
    #[serde(default)]
    pub rack: Option<u16>,
    #[serde(default)]
    pub slot: Option<u16>,
    #[serde(default)]
    pub security_mode: Option<String>,
    #[serde(default)]
    pub security_policy: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// OPC UA subscription mode: data changes are pushed, device is not polled
    #[serde(default)]
    pub enable_subscriptions: bool,
    pub poll_interval_ms: u64,
    pub uns_prefix: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Device {
    /// Key identifying the physical endpoint; the connection pool leases one
    /// client per key
    pub fn address_key(&self) -> String {
        match self.protocol {
            Protocol::ModbusTcp | Protocol::S7 => format!(
                "{}:{}",
                self.host.as_deref().unwrap_or(""),
                self.port.unwrap_or(0)
            ),
            Protocol::ModbusRtu => self.serial_port.clone().unwrap_or_default(),
            Protocol::Opcua => self.endpoint_url.clone().unwrap_or_default(),
        }
    }

    pub fn tag(&self, tag_id: &str) -> Option<&Tag> {
        self.tags.iter().find(|t| t.id == tag_id)
    }
}

/// The canonical normalized record flowing through the pipeline
///
/// Exactly one of `value` / `value_str` is populated. Instances are acquired
/// from the point pool by adapters and released by the publisher after
/// serialization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataPoint {
    pub device_id: String,
    pub tag_id: String,
    pub topic: String,
    pub value: Option<f64>,
    pub value_str: Option<String>,
    pub unit: Option<String>,
    pub quality: Quality,
    pub ts: DateTime<Utc>,
    pub source_ts: Option<DateTime<Utc>>,
    pub server_ts: Option<DateTime<Utc>>,
    /// Pre-scale value, kept for diagnostics
    pub raw_value: Option<f64>,
    /// Publish `value` as a JSON boolean rather than a number
    pub is_bool: bool,
}

impl DataPoint {
    /// Clear all fields so the instance can go back to the pool
    pub fn reset(&mut self) {
        self.device_id.clear();
        self.tag_id.clear();
        self.topic.clear();
        self.value = None;
        self.value_str = None;
        self.unit = None;
        self.quality = Quality::Bad;
        self.ts = Utc::now();
        self.source_ts = None;
        self.server_ts = None;
        self.raw_value = None;
        self.is_bool = false;
    }

    /// Serialize to the UNS wire payload
    pub fn to_payload(&self) -> Vec<u8> {
        let v = match (&self.value, &self.value_str) {
            (Some(n), _) if self.is_bool => serde_json::Value::Bool(*n != 0.0),
            (Some(n), _) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            (None, Some(s)) => serde_json::Value::String(s.clone()),
            (None, None) => serde_json::Value::Null,
        };
        let wire = WirePoint {
            v,
            u: self.unit.clone(),
            q: self.quality,
            ts: self.ts.timestamp_millis(),
            device_id: self.device_id.clone(),
            tag_id: self.tag_id.clone(),
            source_ts: self.source_ts.map(|t| t.to_rfc3339()),
        };
        // Serde-derived over plain fields; serialization cannot fail
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    /// Parse a wire payload back into a DataPoint. `topic` is the MQTT topic
    /// the message arrived on and becomes the canonical topic.
    pub fn from_payload(topic: &str, payload: &[u8]) -> Result<DataPoint, serde_json::Error> {
        let wire: WirePoint = serde_json::from_slice(payload)?;
        let (value, value_str, is_bool) = match wire.v {
            serde_json::Value::Number(n) => (n.as_f64(), None, false),
            serde_json::Value::Bool(b) => (Some(if b { 1.0 } else { 0.0 }), None, true),
            serde_json::Value::String(s) => (None, Some(s), false),
            _ => (None, None, false),
        };
        Ok(DataPoint {
            device_id: wire.device_id,
            tag_id: wire.tag_id,
            topic: topic.to_string(),
            value,
            value_str,
            unit: wire.u,
            quality: wire.q,
            ts: Utc
                .timestamp_millis_opt(wire.ts)
                .single()
                .unwrap_or_else(Utc::now),
            source_ts: wire
                .source_ts
                .as_deref()
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|t| t.with_timezone(&Utc)),
            server_ts: None,
            raw_value: None,
            is_bool,
        })
    }
}

/// JSON shape published on the unified namespace
#[derive(Debug, Serialize, Deserialize)]
struct WirePoint {
    v: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    u: Option<String>,
    q: Quality,
    ts: i64,
    device_id: String,
    tag_id: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    source_ts: Option<String>,
}

/// Typed value carried by a write command
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl TagValue {
    /// Coerce a JSON scalar into the tag's declared type, rejecting values
    /// that do not fit the encoded representation
    pub fn coerce(value: &serde_json::Value, data_type: DataType) -> Result<TagValue, String> {
        match data_type {
            DataType::Bool => match value {
                serde_json::Value::Bool(b) => Ok(TagValue::Bool(*b)),
                serde_json::Value::Number(n) => Ok(TagValue::Bool(n.as_f64() != Some(0.0))),
                _ => Err(format!("cannot coerce {} to bool", value)),
            },
            DataType::String => match value {
                serde_json::Value::String(s) => Ok(TagValue::Text(s.clone())),
                serde_json::Value::Number(n) => Ok(TagValue::Text(n.to_string())),
                serde_json::Value::Bool(b) => Ok(TagValue::Text(b.to_string())),
                _ => Err(format!("cannot coerce {} to string", value)),
            },
            _ => {
                let n = value
                    .as_f64()
                    .ok_or_else(|| format!("cannot coerce {} to number", value))?;
                if !n.is_finite() {
                    return Err("value is not finite".to_string());
                }
                check_numeric_range(n, data_type)?;
                Ok(TagValue::Float(n))
            }
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            TagValue::Int(i) => Some(*i as f64),
            TagValue::Float(f) => Some(*f),
            TagValue::Text(_) => None,
        }
    }
}

fn check_numeric_range(n: f64, data_type: DataType) -> Result<(), String> {
    let (lo, hi) = match data_type {
        DataType::Int16 => (i16::MIN as f64, i16::MAX as f64),
        DataType::Int32 => (i32::MIN as f64, i32::MAX as f64),
        DataType::Int64 => (i64::MIN as f64, i64::MAX as f64),
        DataType::Uint16 => (0.0, u16::MAX as f64),
        DataType::Uint32 => (0.0, u32::MAX as f64),
        DataType::Uint64 => (0.0, u64::MAX as f64),
        _ => return Ok(()),
    };
    if n < lo || n > hi {
        return Err(format!("value {} out of range for {:?}", n, data_type));
    }
    Ok(())
}

/// Write request parsed from an MQTT command message
#[derive(Debug, Clone)]
pub struct Command {
    pub device_id: String,
    pub tag_id: String,
    pub value: serde_json::Value,
    pub request_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

/// Acknowledgement published on the command response topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub request_id: Option<String>,
}

/// Topic fragments must be URL-safe: letters, digits, `-`, `_`
pub fn is_valid_topic_fragment(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// A UNS prefix is a slash-separated non-empty path of URL-safe fragments
/// with no leading or trailing slash
pub fn is_valid_uns_prefix(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('/')
        && !s.ends_with('/')
        && s.split('/').all(is_valid_topic_fragment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn float_tag() -> Tag {
        Tag {
            id: "t1".to_string(),
            name: "Temperature".to_string(),
            address: "40001".to_string(),
            data_type: DataType::Float32,
            byte_order: None,
            scale: Some(0.1),
            offset: Some(0.0),
            clamp_min: None,
            clamp_max: None,
            deadband_absolute: None,
            deadband_percent: None,
            unit: Some("°C".to_string()),
            custom_topic: None,
            writable: false,
        }
    }

    #[test]
    fn test_scale_unscale_round_trip() {
        let tag = float_tag();
        let raw = 845.0;
        let engineering = tag.scale_value(raw);
        assert!((engineering - 84.5).abs() < f64::EPSILON);
        assert!((tag.unscale_value(engineering) - raw).abs() < 1e-9);
    }

    #[test]
    fn test_scale_ignored_for_string() {
        let mut tag = float_tag();
        tag.data_type = DataType::String;
        assert_eq!(tag.scale_value(845.0), 845.0);
    }

    #[test]
    fn test_clamp_applied_after_scale() {
        let mut tag = float_tag();
        tag.clamp_max = Some(50.0);
        assert_eq!(tag.scale_value(845.0), 50.0);
    }

    #[test]
    fn test_topic_uses_uns_prefix() {
        let tag = float_tag();
        assert_eq!(
            tag.topic("plant1/line2/plc1"),
            "plant1/line2/plc1/Temperature"
        );
    }

    #[test]
    fn test_custom_topic_is_absolute() {
        let mut tag = float_tag();
        tag.custom_topic = Some("legacy/boiler/temp".to_string());
        assert_eq!(tag.topic("plant1/line2/plc1"), "legacy/boiler/temp");
    }

    #[test]
    fn test_byte_order_big_endian() {
        let regs = [0x1234u16, 0x5678];
        let bytes = ByteOrder::BigEndian.registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(ByteOrder::BigEndian.bytes_to_registers(&bytes), regs);
    }

    #[test]
    fn test_byte_order_little_endian() {
        let regs = [0x1234u16, 0x5678];
        let bytes = ByteOrder::LittleEndian.registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(ByteOrder::LittleEndian.bytes_to_registers(&bytes), regs);
    }

    #[test]
    fn test_byte_order_word_swap() {
        let regs = [0x1234u16, 0x5678];
        let bytes = ByteOrder::BigEndianWordSwap.registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x56, 0x78, 0x12, 0x34]);
        assert_eq!(ByteOrder::BigEndianWordSwap.bytes_to_registers(&bytes), regs);

        let bytes = ByteOrder::LittleEndianWordSwap.registers_to_bytes(&regs);
        assert_eq!(bytes, vec![0x34, 0x12, 0x78, 0x56]);
        assert_eq!(
            ByteOrder::LittleEndianWordSwap.bytes_to_registers(&bytes),
            regs
        );
    }

    #[test]
    fn test_float32_decode_via_byte_order() {
        let value = 84.5f32;
        let bytes = value.to_be_bytes();
        let regs = ByteOrder::BigEndianWordSwap.bytes_to_registers(&bytes);
        let back = ByteOrder::BigEndianWordSwap.registers_to_bytes(&regs);
        assert_eq!(
            f32::from_be_bytes([back[0], back[1], back[2], back[3]]),
            value
        );
    }

    #[test]
    fn test_payload_round_trip() {
        let dp = DataPoint {
            device_id: "plc-001".to_string(),
            tag_id: "t1".to_string(),
            topic: "plant1/line2/plc1/Temperature".to_string(),
            value: Some(84.5),
            value_str: None,
            unit: Some("°C".to_string()),
            quality: Quality::Good,
            ts: Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap(),
            source_ts: None,
            server_ts: None,
            raw_value: Some(845.0),
            is_bool: false,
        };
        let payload = dp.to_payload();
        let parsed = DataPoint::from_payload(&dp.topic, &payload).unwrap();
        assert_eq!(parsed.device_id, dp.device_id);
        assert_eq!(parsed.tag_id, dp.tag_id);
        assert_eq!(parsed.topic, dp.topic);
        assert_eq!(parsed.value, dp.value);
        assert_eq!(parsed.value_str, None);
        assert_eq!(parsed.quality, Quality::Good);
        assert_eq!(parsed.ts, dp.ts);
    }

    #[test]
    fn test_payload_bool_is_typed() {
        let dp = DataPoint {
            device_id: "plc-001".to_string(),
            tag_id: "run".to_string(),
            topic: "plant1/line2/plc1/Running".to_string(),
            value: Some(1.0),
            quality: Quality::Good,
            ts: Utc::now(),
            is_bool: true,
            ..Default::default()
        };
        let payload = dp.to_payload();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(json["v"], serde_json::Value::Bool(true));
    }

    #[test]
    fn test_payload_string_value() {
        let dp = DataPoint {
            device_id: "plc-001".to_string(),
            tag_id: "state".to_string(),
            topic: "plant1/line2/plc1/State".to_string(),
            value: None,
            value_str: Some("RUNNING".to_string()),
            quality: Quality::Good,
            ts: Utc::now(),
            ..Default::default()
        };
        let parsed = DataPoint::from_payload(&dp.topic, &dp.to_payload()).unwrap();
        assert_eq!(parsed.value, None);
        assert_eq!(parsed.value_str.as_deref(), Some("RUNNING"));
    }

    #[test]
    fn test_coerce_rejects_out_of_range() {
        let v = serde_json::json!(70000);
        assert!(TagValue::coerce(&v, DataType::Uint16).is_err());
        assert!(TagValue::coerce(&v, DataType::Uint32).is_ok());
    }

    #[test]
    fn test_coerce_bool() {
        assert_eq!(
            TagValue::coerce(&serde_json::json!(true), DataType::Bool).unwrap(),
            TagValue::Bool(true)
        );
        assert_eq!(
            TagValue::coerce(&serde_json::json!(0), DataType::Bool).unwrap(),
            TagValue::Bool(false)
        );
    }

    #[test]
    fn test_uns_prefix_validation() {
        assert!(is_valid_uns_prefix("plant1/line2/plc1"));
        assert!(!is_valid_uns_prefix("/plant1/line2"));
        assert!(!is_valid_uns_prefix("plant1/line2/"));
        assert!(!is_valid_uns_prefix(""));
        assert!(!is_valid_uns_prefix("plant 1/line2"));
        assert!(!is_valid_uns_prefix("plant1//line2"));
    }

    #[test]
    fn test_reset_clears_point() {
        let mut dp = DataPoint {
            device_id: "plc-001".to_string(),
            value: Some(1.0),
            quality: Quality::Good,
            ..Default::default()
        };
        dp.reset();
        assert!(dp.device_id.is_empty());
        assert_eq!(dp.value, None);
        assert_eq!(dp.quality, Quality::Bad);
    }
}
