//! Modbus TCP/RTU protocol adapter
//!
//! Polling-based reads of coils, discrete inputs, input registers and
//! holding registers. Contiguous tags in the same register space are
//! coalesced into a single wire request up to the protocol limits
//! (125 registers / 2000 coils). Multi-register numerics honor the
//! per-tag byte order, including the word-swap variants.

use super::{ProtocolAdapter, ProtocolError};
use crate::config::ProtocolPoolConfig;
use crate::model::{DataPoint, DataType, Device, Protocol, Quality, Tag, TagValue};
use crate::point_pool::PointPool;
use async_trait::async_trait;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_modbus::prelude::*;
use tokio_serial::SerialPortBuilderExt;
use tracing::{info, warn};

/// Modbus wire limits for a single read request
pub const MAX_REGISTERS_PER_READ: u16 = 125;
pub const MAX_COILS_PER_READ: u16 = 2000;

/// Register space addressed by a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegisterSpace {
    Coil,
    DiscreteInput,
    InputRegister,
    HoldingRegister,
}

impl RegisterSpace {
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterSpace::Coil | RegisterSpace::HoldingRegister)
    }

    /// Bit-addressed spaces read coils, word-addressed spaces read registers
    pub fn is_bit(&self) -> bool {
        matches!(self, RegisterSpace::Coil | RegisterSpace::DiscreteInput)
    }

    fn read_limit(&self) -> u16 {
        if self.is_bit() {
            MAX_COILS_PER_READ
        } else {
            MAX_REGISTERS_PER_READ
        }
    }
}

/// Parse a Modbus address string.
///
/// Two syntaxes are accepted:
/// - classic data-model numbers: `00001`-`09999` coils, `10001`-`19999`
///   discrete inputs, `30001`-`39999` input registers, `40001`-`49999`
///   holding registers;
/// - explicit space prefixes with a zero-based offset: `co:0`, `di:7`,
///   `ir:100`, `hr:1000`.
pub fn parse_address(address: &str) -> Result<(RegisterSpace, u16), ProtocolError> {
    if let Some((prefix, offset)) = address.split_once(':') {
        let space = match prefix {
            "co" => RegisterSpace::Coil,
            "di" => RegisterSpace::DiscreteInput,
            "ir" => RegisterSpace::InputRegister,
            "hr" => RegisterSpace::HoldingRegister,
            _ => {
                return Err(ProtocolError::InvalidAddress(format!(
                    "unknown register space prefix in {address:?}"
                )))
            }
        };
        let offset = offset.parse::<u16>().map_err(|_| {
            ProtocolError::InvalidAddress(format!("invalid offset in {address:?}"))
        })?;
        return Ok((space, offset));
    }

    let addr = address
        .parse::<u32>()
        .map_err(|_| ProtocolError::InvalidAddress(format!("invalid address {address:?}")))?;

    match addr {
        1..=9999 => Ok((RegisterSpace::Coil, (addr - 1) as u16)),
        10001..=19999 => Ok((RegisterSpace::DiscreteInput, (addr - 10001) as u16)),
        30001..=39999 => Ok((RegisterSpace::InputRegister, (addr - 30001) as u16)),
        40001..=49999 => Ok((RegisterSpace::HoldingRegister, (addr - 40001) as u16)),
        _ => Err(ProtocolError::InvalidAddress(format!(
            "address {address:?} out of range"
        ))),
    }
}

/// Width of a tag in its register space (registers, or bits for bit spaces)
fn tag_width(space: RegisterSpace, data_type: DataType) -> Result<u16, ProtocolError> {
    if space.is_bit() {
        return Ok(1);
    }
    match data_type.register_count() {
        0 => Err(ProtocolError::TypeMismatch(format!(
            "{data_type:?} is not register-addressable"
        ))),
        n => Ok(n),
    }
}

/// One coalesced wire read covering several tags
#[derive(Debug, PartialEq, Eq)]
pub struct ReadBlock {
    pub space: RegisterSpace,
    pub start: u16,
    pub count: u16,
    /// (index into the input tag slice, offset, width)
    pub tags: Vec<(usize, u16, u16)>,
}

/// Group tags into coalesced read blocks.
///
/// Tags are sorted by space and offset; a tag joins the current block when
/// it starts at or inside the block's end and the grown block stays within
/// the wire limit. Tags with invalid addresses are returned separately so
/// the caller can mark them bad without failing the poll.
pub fn plan_blocks(tags: &[Tag]) -> (Vec<ReadBlock>, Vec<usize>) {
    let mut addressed: Vec<(usize, RegisterSpace, u16, u16)> = Vec::with_capacity(tags.len());
    let mut invalid = Vec::new();

    for (idx, tag) in tags.iter().enumerate() {
        match parse_address(&tag.address)
            .and_then(|(space, offset)| Ok((space, offset, tag_width(space, tag.data_type)?)))
        {
            Ok((space, offset, width)) => addressed.push((idx, space, offset, width)),
            Err(_) => invalid.push(idx),
        }
    }

    addressed.sort_by_key(|(_, space, offset, _)| (*space, *offset));

    let mut blocks: Vec<ReadBlock> = Vec::new();
    for (idx, space, offset, width) in addressed {
        let fits = blocks.last().is_some_and(|b| {
            b.space == space
                && offset <= b.start + b.count
                && (offset + width).max(b.start + b.count) - b.start <= space.read_limit()
        });
        if fits {
            let block = blocks.last_mut().expect("checked non-empty");
            block.count = (offset + width - block.start).max(block.count);
            block.tags.push((idx, offset, width));
        } else {
            blocks.push(ReadBlock {
                space,
                start: offset,
                count: width,
                tags: vec![(idx, offset, width)],
            });
        }
    }
    (blocks, invalid)
}

/// Decode a tag value from the registers covering it
fn decode_registers(tag: &Tag, regs: &[u16]) -> Result<f64, ProtocolError> {
    let order = tag.byte_order();
    let bytes = order.registers_to_bytes(regs);
    let value = match tag.data_type {
        DataType::Bool => {
            if regs.iter().any(|r| *r != 0) {
                1.0
            } else {
                0.0
            }
        }
        DataType::Int16 => regs[0] as i16 as f64,
        DataType::Uint16 => regs[0] as f64,
        DataType::Int32 => i32::from_be_bytes(bytes[..4].try_into().expect("2 regs")) as f64,
        DataType::Uint32 => u32::from_be_bytes(bytes[..4].try_into().expect("2 regs")) as f64,
        DataType::Int64 => i64::from_be_bytes(bytes[..8].try_into().expect("4 regs")) as f64,
        DataType::Uint64 => u64::from_be_bytes(bytes[..8].try_into().expect("4 regs")) as f64,
        DataType::Float32 => f32::from_be_bytes(bytes[..4].try_into().expect("2 regs")) as f64,
        DataType::Float64 => f64::from_be_bytes(bytes[..8].try_into().expect("4 regs")),
        DataType::String => {
            return Err(ProtocolError::TypeMismatch(
                "string tags are not register-addressable".into(),
            ))
        }
    };
    Ok(value)
}

/// Encode an unscaled value into wire registers for a write
fn encode_registers(tag: &Tag, raw: f64) -> Result<Vec<u16>, ProtocolError> {
    let order = tag.byte_order();
    let bytes: Vec<u8> = match tag.data_type {
        DataType::Int16 => {
            let v = check_int(raw, i16::MIN as f64, i16::MAX as f64, tag)? as i16;
            return Ok(vec![v as u16]);
        }
        DataType::Uint16 => {
            let v = check_int(raw, 0.0, u16::MAX as f64, tag)? as u16;
            return Ok(vec![v]);
        }
        DataType::Int32 => (check_int(raw, i32::MIN as f64, i32::MAX as f64, tag)? as i32)
            .to_be_bytes()
            .to_vec(),
        DataType::Uint32 => (check_int(raw, 0.0, u32::MAX as f64, tag)? as u32)
            .to_be_bytes()
            .to_vec(),
        DataType::Int64 => (check_int(raw, i64::MIN as f64, i64::MAX as f64, tag)? as i64)
            .to_be_bytes()
            .to_vec(),
        DataType::Uint64 => (check_int(raw, 0.0, u64::MAX as f64, tag)? as u64)
            .to_be_bytes()
            .to_vec(),
        DataType::Float32 => (raw as f32).to_be_bytes().to_vec(),
        DataType::Float64 => raw.to_be_bytes().to_vec(),
        DataType::Bool | DataType::String => {
            return Err(ProtocolError::TypeMismatch(format!(
                "{:?} is not register-encodable",
                tag.data_type
            )))
        }
    };
    Ok(order.bytes_to_registers(&bytes))
}

fn check_int(raw: f64, lo: f64, hi: f64, tag: &Tag) -> Result<f64, ProtocolError> {
    let rounded = raw.round();
    if rounded < lo || rounded > hi {
        return Err(ProtocolError::TypeMismatch(format!(
            "unscaled value {raw} does not fit {:?} for tag {}",
            tag.data_type, tag.name
        )));
    }
    Ok(rounded)
}

enum Transport {
    Tcp(SocketAddr),
    Rtu { path: String, baud_rate: u32 },
}

/// One adapter per device; the pool serializes access to it
pub struct ModbusAdapter {
    device: Arc<Device>,
    config: ProtocolPoolConfig,
    points: Arc<PointPool>,
    transport: Transport,
    ctx: Option<client::Context>,
}

impl ModbusAdapter {
    pub fn new(
        device: Arc<Device>,
        config: ProtocolPoolConfig,
        points: Arc<PointPool>,
    ) -> Result<Self, ProtocolError> {
        let transport = match device.protocol {
            Protocol::ModbusTcp => {
                let host = device.host.as_deref().ok_or_else(|| {
                    ProtocolError::InvalidConfiguration(format!("{}: host not set", device.id))
                })?;
                let addr = format!("{}:{}", host, device.port.unwrap_or(502))
                    .parse::<SocketAddr>()
                    .map_err(|e| {
                        ProtocolError::InvalidConfiguration(format!(
                            "{}: invalid socket address: {e}",
                            device.id
                        ))
                    })?;
                Transport::Tcp(addr)
            }
            Protocol::ModbusRtu => Transport::Rtu {
                path: device.serial_port.clone().ok_or_else(|| {
                    ProtocolError::InvalidConfiguration(format!(
                        "{}: serial_port not set",
                        device.id
                    ))
                })?,
                baud_rate: device.baud_rate.unwrap_or(9600),
            },
            other => {
                return Err(ProtocolError::InvalidConfiguration(format!(
                    "modbus adapter cannot serve {other}"
                )))
            }
        };
        Ok(Self {
            device,
            config,
            points,
            transport,
            ctx: None,
        })
    }

    fn context(&mut self) -> Result<&mut client::Context, ProtocolError> {
        self.ctx.as_mut().ok_or(ProtocolError::NotConnected)
    }

    fn fill_point(&self, tag: &Tag, quality: Quality, raw: Option<f64>) -> DataPoint {
        let mut dp = self.points.acquire();
        dp.device_id = self.device.id.clone();
        dp.tag_id = tag.id.clone();
        dp.topic = tag.topic(&self.device.uns_prefix);
        dp.quality = quality;
        dp.ts = Utc::now();
        dp.unit = tag.unit.clone();
        if let Some(raw) = raw {
            dp.raw_value = Some(raw);
            dp.value = Some(tag.scale_value(raw));
            dp.is_bool = tag.data_type == DataType::Bool;
        }
        dp
    }
}

#[async_trait]
impl ProtocolAdapter for ModbusAdapter {
    async fn connect(&mut self) -> Result<(), ProtocolError> {
        let slave = Slave(self.device.unit_id.unwrap_or(1));
        let connect_timeout = self.config.connection_timeout();

        let ctx = match &self.transport {
            Transport::Tcp(addr) => {
                info!(device_id = %self.device.id, endpoint = %addr, "Connecting to Modbus TCP device");
                timeout(connect_timeout, tcp::connect_slave(*addr, slave))
                    .await
                    .map_err(|_| ProtocolError::Timeout)?
                    .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?
            }
            Transport::Rtu { path, baud_rate } => {
                info!(device_id = %self.device.id, serial_port = %path, "Connecting to Modbus RTU device");
                let stream = tokio_serial::new(path, *baud_rate)
                    .open_native_async()
                    .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;
                rtu::attach_slave(stream, slave)
            }
        };
        self.ctx = Some(ctx);
        Ok(())
    }

    async fn read_tags(
        &mut self,
        device: &Device,
        tags: &[Tag],
    ) -> Result<Vec<DataPoint>, ProtocolError> {
        debug_assert_eq!(device.id, self.device.id);
        if self.ctx.is_none() {
            return Err(ProtocolError::NotConnected);
        }

        let (blocks, invalid) = plan_blocks(tags);
        let mut points: Vec<Option<DataPoint>> = (0..tags.len()).map(|_| None).collect();

        for idx in invalid {
            points[idx] = Some(self.fill_point(&tags[idx], Quality::Bad, None));
        }

        for block in &blocks {
            let ctx = self.context()?;
            if block.space.is_bit() {
                let resp = match block.space {
                    RegisterSpace::Coil => ctx.read_coils(block.start, block.count).await,
                    _ => ctx.read_discrete_inputs(block.start, block.count).await,
                };
                match resp {
                    Err(e) => {
                        self.ctx = None;
                        return Err(ProtocolError::ConnectionLost(e.to_string()));
                    }
                    Ok(Err(exc)) => {
                        warn!(device_id = %self.device.id, space = ?block.space, start = block.start, exception = %exc, "Modbus read rejected");
                        for (idx, _, _) in &block.tags {
                            points[*idx] = Some(self.fill_point(&tags[*idx], Quality::Bad, None));
                        }
                    }
                    Ok(Ok(bits)) => {
                        for (idx, offset, _) in &block.tags {
                            let bit = bits
                                .get((offset - block.start) as usize)
                                .copied()
                                .unwrap_or(false);
                            let raw = if bit { 1.0 } else { 0.0 };
                            points[*idx] =
                                Some(self.fill_point(&tags[*idx], Quality::Good, Some(raw)));
                        }
                    }
                }
            } else {
                let resp = match block.space {
                    RegisterSpace::InputRegister => {
                        ctx.read_input_registers(block.start, block.count).await
                    }
                    _ => ctx.read_holding_registers(block.start, block.count).await,
                };
                match resp {
                    Err(e) => {
                        self.ctx = None;
                        return Err(ProtocolError::ConnectionLost(e.to_string()));
                    }
                    Ok(Err(exc)) => {
                        warn!(device_id = %self.device.id, space = ?block.space, start = block.start, exception = %exc, "Modbus read rejected");
                        for (idx, _, _) in &block.tags {
                            points[*idx] = Some(self.fill_point(&tags[*idx], Quality::Bad, None));
                        }
                    }
                    Ok(Ok(regs)) => {
                        for (idx, offset, width) in &block.tags {
                            let lo = (offset - block.start) as usize;
                            let hi = lo + *width as usize;
                            let point = match regs.get(lo..hi) {
                                Some(slice) => match decode_registers(&tags[*idx], slice) {
                                    Ok(raw) => {
                                        self.fill_point(&tags[*idx], Quality::Good, Some(raw))
                                    }
                                    Err(_) => self.fill_point(&tags[*idx], Quality::Bad, None),
                                },
                                None => self.fill_point(&tags[*idx], Quality::Bad, None),
                            };
                            points[*idx] = Some(point);
                        }
                    }
                }
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
        let (space, offset) = parse_address(&tag.address)?;
        if !space.is_writable() || !tag.writable {
            return Err(ProtocolError::NotWritable(tag.name.clone()));
        }

        match space {
            RegisterSpace::Coil => {
                let state = match value {
                    TagValue::Bool(b) => *b,
                    other => other
                        .as_f64()
                        .map(|v| v != 0.0)
                        .ok_or_else(|| ProtocolError::TypeMismatch("coil expects bool".into()))?,
                };
                let ctx = self.context()?;
                let resp = ctx.write_single_coil(offset, state).await;
                map_write_result(resp, &mut self.ctx)
            }
            RegisterSpace::HoldingRegister => {
                let engineering = value.as_f64().ok_or_else(|| {
                    ProtocolError::TypeMismatch("holding register expects a number".into())
                })?;
                let regs = encode_registers(tag, tag.unscale_value(engineering))?;
                let ctx = self.context()?;
                if regs.len() == 1 {
                    let resp = ctx.write_single_register(offset, regs[0]).await;
                    map_write_result(resp, &mut self.ctx)
                } else {
                    let resp = ctx.write_multiple_registers(offset, &regs).await;
                    map_write_result(resp, &mut self.ctx)
                }
            }
            _ => Err(ProtocolError::NotWritable(tag.name.clone())),
        }
    }

    async fn ping(&mut self) -> Result<(), ProtocolError> {
        let ctx = self.context()?;
        // an exception response still proves the device is talking
        match ctx.read_holding_registers(0, 1).await {
            Err(e) => {
                self.ctx = None;
                Err(ProtocolError::ConnectionLost(e.to_string()))
            }
            Ok(_) => Ok(()),
        }
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        if let Some(mut ctx) = self.ctx.take() {
            let _ = ctx.disconnect().await;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn protocol_name(&self) -> &'static str {
        match self.device.protocol {
            Protocol::ModbusRtu => "modbus-rtu",
            _ => "modbus-tcp",
        }
    }
}

fn map_write_result<E1: std::fmt::Display, E2: std::fmt::Display>(
    resp: Result<Result<(), E2>, E1>,
    ctx: &mut Option<client::Context>,
) -> Result<(), ProtocolError> {
    match resp {
        Err(e) => {
            *ctx = None;
            Err(ProtocolError::ConnectionLost(e.to_string()))
        }
        Ok(Err(exc)) => Err(ProtocolError::WriteFailed(exc.to_string())),
        Ok(Ok(())) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ByteOrder;

    fn tag(address: &str, data_type: DataType) -> Tag {
        Tag {
            id: format!("t-{address}"),
            name: format!("tag_{}", address.replace(':', "_")),
            address: address.to_string(),
            data_type,
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
    fn test_parse_classic_addresses() {
        assert_eq!(parse_address("00001").unwrap(), (RegisterSpace::Coil, 0));
        assert_eq!(
            parse_address("10001").unwrap(),
            (RegisterSpace::DiscreteInput, 0)
        );
        assert_eq!(
            parse_address("30001").unwrap(),
            (RegisterSpace::InputRegister, 0)
        );
        assert_eq!(
            parse_address("40001").unwrap(),
            (RegisterSpace::HoldingRegister, 0)
        );
        assert_eq!(
            parse_address("40100").unwrap(),
            (RegisterSpace::HoldingRegister, 99)
        );
    }

    #[test]
    fn test_parse_prefixed_addresses() {
        assert_eq!(
            parse_address("hr:1000").unwrap(),
            (RegisterSpace::HoldingRegister, 1000)
        );
        assert_eq!(parse_address("co:0").unwrap(), (RegisterSpace::Coil, 0));
        assert_eq!(
            parse_address("ir:42").unwrap(),
            (RegisterSpace::InputRegister, 42)
        );
        assert_eq!(
            parse_address("di:7").unwrap(),
            (RegisterSpace::DiscreteInput, 7)
        );
    }

    #[test]
    fn test_parse_invalid_addresses() {
        assert!(parse_address("invalid").is_err());
        assert!(parse_address("99999").is_err());
        assert!(parse_address("xx:1").is_err());
        assert!(parse_address("hr:notanumber").is_err());
        assert!(parse_address("0").is_err());
    }

    #[test]
    fn test_contiguous_tags_coalesce() {
        let tags = vec![
            tag("40001", DataType::Uint16),
            tag("40002", DataType::Uint16),
            tag("40003", DataType::Float32),
        ];
        let (blocks, invalid) = plan_blocks(&tags);
        assert!(invalid.is_empty());
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start, 0);
        assert_eq!(blocks[0].count, 4);
        assert_eq!(blocks[0].tags.len(), 3);
    }

    #[test]
    fn test_gap_splits_blocks() {
        let tags = vec![tag("40001", DataType::Uint16), tag("40010", DataType::Uint16)];
        let (blocks, _) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_different_spaces_never_coalesce() {
        let tags = vec![tag("40001", DataType::Uint16), tag("30001", DataType::Uint16)];
        let (blocks, _) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_register_limit_boundary() {
        // 125 contiguous registers fit one read
        let tags: Vec<Tag> = (0..125).map(|i| tag(&format!("hr:{i}"), DataType::Uint16)).collect();
        let (blocks, _) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count, 125);

        // the 126th splits into a second read
        let tags: Vec<Tag> = (0..126).map(|i| tag(&format!("hr:{i}"), DataType::Uint16)).collect();
        let (blocks, _) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].count, 125);
        assert_eq!(blocks[1].count, 1);
    }

    #[test]
    fn test_coil_limit() {
        let tags: Vec<Tag> = (0..2000).map(|i| tag(&format!("co:{i}"), DataType::Bool)).collect();
        let (blocks, _) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].count, 2000);
    }

    #[test]
    fn test_invalid_address_isolated() {
        let tags = vec![tag("40001", DataType::Uint16), tag("garbage", DataType::Uint16)];
        let (blocks, invalid) = plan_blocks(&tags);
        assert_eq!(blocks.len(), 1);
        assert_eq!(invalid, vec![1]);
    }

    #[test]
    fn test_decode_uint16() {
        let t = tag("40001", DataType::Uint16);
        assert_eq!(decode_registers(&t, &[845]).unwrap(), 845.0);
    }

    #[test]
    fn test_decode_int16_sign() {
        let t = tag("40001", DataType::Int16);
        assert_eq!(decode_registers(&t, &[0xFFFF]).unwrap(), -1.0);
    }

    #[test]
    fn test_decode_float32_word_swap() {
        let mut t = tag("40001", DataType::Float32);
        t.byte_order = Some(ByteOrder::BigEndianWordSwap);
        let bytes = 84.5f32.to_be_bytes();
        let regs = ByteOrder::BigEndianWordSwap.bytes_to_registers(&bytes);
        assert_eq!(decode_registers(&t, &regs).unwrap(), 84.5);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        for order in [
            ByteOrder::BigEndian,
            ByteOrder::LittleEndian,
            ByteOrder::BigEndianWordSwap,
            ByteOrder::LittleEndianWordSwap,
        ] {
            let mut t = tag("40001", DataType::Float32);
            t.byte_order = Some(order);
            let regs = encode_registers(&t, 123.25).unwrap();
            assert_eq!(decode_registers(&t, &regs).unwrap(), 123.25);
        }
    }

    #[test]
    fn test_encode_rejects_overflow() {
        let t = tag("40001", DataType::Uint16);
        assert!(encode_registers(&t, 70000.0).is_err());
        assert!(encode_registers(&t, -1.0).is_err());
    }

    #[test]
    fn test_encode_int32() {
        let t = tag("40001", DataType::Int32);
        let regs = encode_registers(&t, -755.0).unwrap();
        assert_eq!(decode_registers(&t, &regs).unwrap(), -755.0);
    }
}
