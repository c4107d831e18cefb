//! Siemens S7 protocol adapter
//!
//! Address syntax follows STEP 7 notation: `DB5.DBX3.2`, `DB5.DBW20`,
//! `M10.1`, `MW10`, `I0.0`/`E0.0`, `Q0.0`/`A0.0`, `T5`, `C5`. Writability is
//! area-derived: inputs, timers and counters are read-only; outputs, merker
//! and data blocks accept writes. Reads pack multiple items per request up
//! to the negotiated PDU size.

use super::s7_wire::{area, S7Client, S7Item};
use super::{ProtocolAdapter, ProtocolError};
use crate::config::ProtocolPoolConfig;
use crate::model::{DataPoint, DataType, Device, Quality, Tag, TagValue};
use crate::point_pool::PointPool;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

/// Parsed S7 address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Address {
    pub area: u8,
    pub db: u16,
    pub byte_offset: u32,
    pub bit: u8,
    pub is_bit: bool,
}

impl S7Address {
    /// Inputs, timers and counters cannot be written
    pub fn is_writable(&self) -> bool {
        !matches!(self.area, area::INPUT | area::TIMER | area::COUNTER)
    }

    fn item(&self, byte_len: u16) -> S7Item {
        S7Item {
            area: self.area,
            db: self.db,
            byte_offset: self.byte_offset,
            bit: self.bit,
            is_bit: self.is_bit,
            byte_len,
        }
    }
}

/// Parse STEP 7 style addresses
pub fn parse_address(address: &str) -> Result<S7Address, ProtocolError> {
    let addr = address.trim();
    let invalid = || ProtocolError::InvalidAddress(format!("invalid S7 address {address:?}"));

    let upper = addr.to_ascii_uppercase();

    if let Some(rest) = upper.strip_prefix("DB") {
        // DB<n>.DB[XBWD]<byte>[.<bit>]
        let (db_str, item) = rest.split_once('.').ok_or_else(invalid)?;
        let db = db_str.parse::<u16>().map_err(|_| invalid())?;
        let item = item.strip_prefix("DB").ok_or_else(invalid)?;
        let (kind, loc) = item.split_at(1);
        return match kind {
            "X" => {
                let (byte_str, bit_str) = loc.split_once('.').ok_or_else(invalid)?;
                let byte_offset = byte_str.parse::<u32>().map_err(|_| invalid())?;
                let bit = bit_str.parse::<u8>().map_err(|_| invalid())?;
                if bit > 7 {
                    return Err(invalid());
                }
                Ok(S7Address {
                    area: area::DATA_BLOCK,
                    db,
                    byte_offset,
                    bit,
                    is_bit: true,
                })
            }
            "B" | "W" | "D" => Ok(S7Address {
                area: area::DATA_BLOCK,
                db,
                byte_offset: loc.parse::<u32>().map_err(|_| invalid())?,
                bit: 0,
                is_bit: false,
            }),
            _ => Err(invalid()),
        };
    }

    // timers and counters: T5, C5 (Z5 in German notation)
    if let Some(loc) = upper.strip_prefix('T') {
        if let Ok(n) = loc.parse::<u32>() {
            return Ok(S7Address {
                area: area::TIMER,
                db: 0,
                byte_offset: n,
                bit: 0,
                is_bit: false,
            });
        }
    }
    if let Some(loc) = upper.strip_prefix('C').or_else(|| upper.strip_prefix('Z')) {
        if let Ok(n) = loc.parse::<u32>() {
            return Ok(S7Address {
                area: area::COUNTER,
                db: 0,
                byte_offset: n,
                bit: 0,
                is_bit: false,
            });
        }
    }

    // M / I / E / Q / A with optional width letter
    let mut chars = upper.chars();
    let area_char = chars.next().ok_or_else(invalid)?;
    let mem_area = match area_char {
        'M' => area::MERKER,
        'I' | 'E' => area::INPUT,
        'Q' | 'A' => area::OUTPUT,
        _ => return Err(invalid()),
    };
    let rest: String = chars.collect();

    if let Some(loc) = rest
        .strip_prefix('B')
        .or_else(|| rest.strip_prefix('W'))
        .or_else(|| rest.strip_prefix('D'))
    {
        return Ok(S7Address {
            area: mem_area,
            db: 0,
            byte_offset: loc.parse::<u32>().map_err(|_| invalid())?,
            bit: 0,
            is_bit: false,
        });
    }

    // bit form: <byte>.<bit>
    let (byte_str, bit_str) = rest.split_once('.').ok_or_else(invalid)?;
    let byte_offset = byte_str.parse::<u32>().map_err(|_| invalid())?;
    let bit = bit_str.parse::<u8>().map_err(|_| invalid())?;
    if bit > 7 {
        return Err(invalid());
    }
    Ok(S7Address {
        area: mem_area,
        db: 0,
        byte_offset,
        bit,
        is_bit: true,
    })
}

/// Bytes a tag occupies in PLC memory
fn byte_len(data_type: DataType) -> Result<u16, ProtocolError> {
    Ok(match data_type {
        DataType::Bool => 1,
        DataType::Int16 | DataType::Uint16 => 2,
        DataType::Int32 | DataType::Uint32 | DataType::Float32 => 4,
        DataType::Int64 | DataType::Uint64 | DataType::Float64 => 8,
        DataType::String => {
            return Err(ProtocolError::TypeMismatch(
                "string tags are not supported on s7".into(),
            ))
        }
    })
}

/// Decode big-endian PLC bytes per the tag's type
fn decode_bytes(data_type: DataType, bytes: &[u8]) -> Option<f64> {
    Some(match data_type {
        DataType::Bool => {
            if bytes.iter().any(|b| *b != 0) {
                1.0
            } else {
                0.0
            }
        }
        DataType::Int16 => i16::from_be_bytes(bytes.get(..2)?.try_into().ok()?) as f64,
        DataType::Uint16 => u16::from_be_bytes(bytes.get(..2)?.try_into().ok()?) as f64,
        DataType::Int32 => i32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as f64,
        DataType::Uint32 => u32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as f64,
        DataType::Int64 => i64::from_be_bytes(bytes.get(..8)?.try_into().ok()?) as f64,
        DataType::Uint64 => u64::from_be_bytes(bytes.get(..8)?.try_into().ok()?) as f64,
        DataType::Float32 => f32::from_be_bytes(bytes.get(..4)?.try_into().ok()?) as f64,
        DataType::Float64 => f64::from_be_bytes(bytes.get(..8)?.try_into().ok()?),
        DataType::String => return None,
    })
}

/// Encode an unscaled value as big-endian PLC bytes
fn encode_bytes(data_type: DataType, raw: f64) -> Result<Vec<u8>, ProtocolError> {
    let out_of_range =
        |raw: f64| ProtocolError::TypeMismatch(format!("unscaled value {raw} does not fit {data_type:?}"));
    Ok(match data_type {
        DataType::Bool => vec![if raw != 0.0 { 1 } else { 0 }],
        DataType::Int16 => {
            let v = raw.round();
            if v < i16::MIN as f64 || v > i16::MAX as f64 {
                return Err(out_of_range(raw));
            }
            (v as i16).to_be_bytes().to_vec()
        }
        DataType::Uint16 => {
            let v = raw.round();
            if v < 0.0 || v > u16::MAX as f64 {
                return Err(out_of_range(raw));
            }
            (v as u16).to_be_bytes().to_vec()
        }
        DataType::Int32 => {
            let v = raw.round();
            if v < i32::MIN as f64 || v > i32::MAX as f64 {
                return Err(out_of_range(raw));
            }
            (v as i32).to_be_bytes().to_vec()
        }
        DataType::Uint32 => {
            let v = raw.round();
            if v < 0.0 || v > u32::MAX as f64 {
                return Err(out_of_range(raw));
            }
            (v as u32).to_be_bytes().to_vec()
        }
        DataType::Int64 => (raw.round() as i64).to_be_bytes().to_vec(),
        DataType::Uint64 => {
            if raw < 0.0 {
                return Err(out_of_range(raw));
            }
            (raw.round() as u64).to_be_bytes().to_vec()
        }
        DataType::Float32 => (raw as f32).to_be_bytes().to_vec(),
        DataType::Float64 => raw.to_be_bytes().to_vec(),
        DataType::String => {
            return Err(ProtocolError::TypeMismatch(
                "string tags are not supported on s7".into(),
            ))
        }
    })
}

pub struct S7Adapter {
    device: Arc<Device>,
    config: ProtocolPoolConfig,
    points: Arc<PointPool>,
    client: Option<S7Client>,
}

impl S7Adapter {
    pub fn new(device: Arc<Device>, config: ProtocolPoolConfig, points: Arc<PointPool>) -> Self {
        Self {
            device,
            config,
            points,
            client: None,
        }
    }

    fn fill_point(&self, tag: &Tag, quality: Quality, raw: Option<f64>) -> DataPoint {
        let mut dp = self.points.acquire();
        dp.device_id = self.device.id.clone();
        dp.tag_id = tag.id.clone();
        dp.topic = tag.topic(&self.device.uns_prefix);
        dp.unit = tag.unit.clone();
        dp.quality = quality;
        dp.ts = Utc::now();
        if let Some(raw) = raw {
            dp.raw_value = Some(raw);
            dp.value = Some(tag.scale_value(raw));
            dp.is_bool = tag.data_type == DataType::Bool;
        }
        dp
    }
}

#[async_trait]
impl ProtocolAdapter for S7Adapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        let host = self
            .device
            .host
            .as_deref()
            .ok_or_else(|| ProtocolError::InvalidConfiguration("host not set".into()))?;
        let client = S7Client::connect(
            host,
            self.device.port.unwrap_or(102),
            self.device.rack.unwrap_or(0),
            self.device.slot.unwrap_or(2),
            self.config.connection_timeout(),
        )
        .await?;
        self.client = Some(client);
        Ok(())
    }

    async fn read_tags(
        &mut self,
        device: &Device,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, ProtocolError> {
        debug_assert_eq!(device.id, self.device.id);
        if self.client.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        // resolve addresses; broken ones become bad points without a wire op
        let mut resolved: Vec<(usize, S7Item)> = Vec::with_capacity(tags.len());
        let mut points: Vec<Option<DataPoint>> = (0..tags.len()).map(|_| None).collect();
        for (idx, tag) in tags.iter().enumerate() {
            match parse_address(&tag.address).and_then(|a| Ok(a.item(byte_len(tag.data_type)?))) {
                Ok(item) => resolved.push((idx, item)),
                Err(_) => points[idx] = Some(self.fill_point(&tags[idx], Quality::Bad, None)),
            }
        }

        // chunk into multi-item requests bounded by the negotiated PDU
        let mut chunks: Vec<Vec<(usize, S7Item)>> = Vec::new();
        {
            let client = self.client.as_ref().expect("checked above");
            let mut current: Vec<(usize, S7Item)> = Vec::new();
            for (idx, item) in resolved {
                let items_only: Vec<S7Item> = current.iter().map(|(_, i)| *i).collect();
                if current.is_empty() || client.fits_in_pdu(&items_only, &item) {
                    current.push((idx, item));
                } else {
                    chunks.push(std::mem::take(&mut current));
                    current.push((idx, item));
                }
            }
            if !current.is_empty() {
                chunks.push(current);
            }
        }

        for chunk in &chunks {
            let items: Vec<S7Item> = chunk.iter().map(|(_, i)| *i).collect();
            let client = self.client.as_mut().expect("checked above");
            let results = match client.read_items(&items).await {
                Ok(r) => r,
                Err(e) if e.is_retryable() => {
                    self.client = None;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            for ((idx, item), result) in chunk.iter().zip(results) {
                let point = match result {
                    Ok(bytes) => {
                        let raw = if item.is_bit {
                            Some(if bytes.first().copied().unwrap_or(0) != 0 {
                                1.0
                            } else {
                                0.0
                            })
                        } else {
                            decode_bytes(tags[*idx].data_type, &bytes)
                        };
                        match raw {
                            Some(raw) => self.fill_point(&tags[*idx], Quality::Good, Some(raw)),
                            None => self.fill_point(&tags[*idx], Quality::Bad, None),
                        }
                    }
                    Err(code) => {
                        warn!(
                            device_id = %self.device.id,
                            tag = %tags[*idx].name,
                            return_code = format!("{code:#04x}"),
                            "PLC rejected item"
                        );
                        self.fill_point(&tags[*idx], Quality::Bad, None)
                    }
                };
                points[*idx] = Some(point);
            }
        }

        Ok(points.into_iter().flatten().collect())
    }

    async fn write_tag(
        &mut self,
        _device: &Device,
        tag: &Tag,
        value: &TagValue,
    ) -> Result<(), ProtocolError> {
        let address = parse_address(&tag.address)?;
        if !address.is_writable() || !tag.writable {
            return Err(ProtocolError::NotWritable(tag.name.clone()));
        }

        let data = if address.is_bit {
            let state = match value {
                TagValue::Bool(b) => *b,
                other => other
                    .as_f64()
                    .map(|v| v != 0.0)
                    .ok_or_else(|| ProtocolError::TypeMismatch("bit expects bool".into()))?,
            };
            vec![if state { 1 } else { 0 }]
        } else {
            let engineering = value
                .as_f64()
                .ok_or_else(|| ProtocolError::TypeMismatch("expected a number".into()))?;
            encode_bytes(tag.data_type, tag.unscale_value(engineering))?
        };

        let item = address.item(data.len() as u16);
        let client = self.client.as_mut().ok_or(ProtocolError::NotConnected)?;
        match client.write_item(&item, &data).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                self.client = None;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn ping(&mut self) -> Result<(), ProtocolError> {
        let client = self.client.as_mut().ok_or(ProtocolError::NotConnected)?;
        let probe = S7Item {
            area: area::MERKER,
            db: 0,
            byte_offset: 0,
            bit: 0,
            is_bit: false,
            byte_len: 1,
        };
        // a per-item rejection still proves the PLC answers
        match client.read_items(&[probe]).await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.client = None;
                Err(e)
            }
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut client) = self.client.take() {
            client.shutdown().await;
            debug!(device_id = %self.device.id, "S7 connection closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn protocol_name(&self) -> &'static str {
        "s7"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_db_addresses() {
        let a = parse_address("DB5.DBX3.2").unwrap();
        assert_eq!(a.area, area::DATA_BLOCK);
        assert_eq!(a.db, 5);
        assert_eq!(a.byte_offset, 3);
        assert_eq!(a.bit, 2);
        assert!(a.is_bit);

        let a = parse_address("DB10.DBW20").unwrap();
        assert_eq!(a.db, 10);
        assert_eq!(a.byte_offset, 20);
        assert!(!a.is_bit);

        let a = parse_address("DB1.DBD0").unwrap();
        assert_eq!(a.byte_offset, 0);

        let a = parse_address("DB2.DBB7").unwrap();
        assert_eq!(a.byte_offset, 7);
    }

    #[test]
    fn test_parse_merker_and_io() {
        let a = parse_address("M10.1").unwrap();
        assert_eq!(a.area, area::MERKER);
        assert!(a.is_bit);
        assert_eq!((a.byte_offset, a.bit), (10, 1));

        let a = parse_address("MW10").unwrap();
        assert_eq!(a.area, area::MERKER);
        assert!(!a.is_bit);

        let a = parse_address("I0.0").unwrap();
        assert_eq!(a.area, area::INPUT);
        // German notation maps to the same areas
        assert_eq!(parse_address("E0.0").unwrap(), a);

        let a = parse_address("Q4.7").unwrap();
        assert_eq!(a.area, area::OUTPUT);
        assert_eq!(parse_address("A4.7").unwrap(), a);
    }

    #[test]
    fn test_parse_timer_counter() {
        let a = parse_address("T5").unwrap();
        assert_eq!(a.area, area::TIMER);
        assert_eq!(a.byte_offset, 5);

        let a = parse_address("C12").unwrap();
        assert_eq!(a.area, area::COUNTER);
        assert_eq!(parse_address("Z12").unwrap(), a);
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(parse_address("").is_err());
        assert!(parse_address("DB5").is_err());
        assert!(parse_address("DB5.DBX3.9").is_err());
        assert!(parse_address("X10.1").is_err());
        assert!(parse_address("M10.8").is_err());
        assert!(parse_address("40001").is_err());
    }

    #[test]
    fn test_writability_is_area_derived() {
        assert!(parse_address("DB5.DBW0").unwrap().is_writable());
        assert!(parse_address("M10.1").unwrap().is_writable());
        assert!(parse_address("Q0.0").unwrap().is_writable());
        assert!(!parse_address("I0.0").unwrap().is_writable());
        assert!(!parse_address("T5").unwrap().is_writable());
        assert!(!parse_address("C5").unwrap().is_writable());
    }

    #[test]
    fn test_decode_encode_round_trip() {
        for (dt, v) in [
            (DataType::Int16, -123.0),
            (DataType::Uint16, 845.0),
            (DataType::Int32, -70000.0),
            (DataType::Float32, 84.5),
            (DataType::Float64, 1234.5678),
        ] {
            let bytes = encode_bytes(dt, v).unwrap();
            assert_eq!(decode_bytes(dt, &bytes), Some(v), "{dt:?}");
        }
    }

    #[test]
    fn test_encode_range_check() {
        assert!(encode_bytes(DataType::Uint16, -1.0).is_err());
        assert!(encode_bytes(DataType::Int16, 40000.0).is_err());
    }
}
