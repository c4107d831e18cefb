//! S7comm wire protocol over ISO-on-TCP
//!
//! No maintained crate covers S7, so the framing lives here: TPKT (RFC 1006)
//! carrying COTP class 0, carrying S7comm job/ack-data PDUs. Only the three
//! PDU kinds the gateway needs are implemented: setup-communication,
//! read-var and write-var. Frame building and parsing are pure functions so
//! they can be tested without a PLC on the wire.

use super::ProtocolError;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Memory areas addressable in a read/write item
pub mod area {
    pub const INPUT: u8 = 0x81;
    pub const OUTPUT: u8 = 0x82;
    pub const MERKER: u8 = 0x83;
    pub const DATA_BLOCK: u8 = 0x84;
    pub const COUNTER: u8 = 0x1C;
    pub const TIMER: u8 = 0x1D;
}

/// Per-item return codes in an ack-data PDU
pub mod retcode {
    pub const SUCCESS: u8 = 0xFF;
    pub const OUT_OF_RANGE: u8 = 0x05;
    pub const OBJECT_DOES_NOT_EXIST: u8 = 0x0A;
}

/// Cap on items per read-var request; matches what field PLCs accept
pub const MAX_ITEMS_PER_READ: usize = 18;
/// PDU size requested during setup-communication
const REQUESTED_PDU_SIZE: u16 = 960;

/// One addressed region of PLC memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct S7Item {
    pub area: u8,
    /// DB number; zero outside the DB area
    pub db: u16,
    pub byte_offset: u32,
    /// Bit index for single-bit items
    pub bit: u8,
    pub is_bit: bool,
    /// Bytes to transfer for non-bit items
    pub byte_len: u16,
}

impl S7Item {
    fn bit_address(&self) -> u32 {
        self.byte_offset * 8 + self.bit as u32
    }

    /// 12-byte S7ANY item specification
    fn encode_spec(&self, out: &mut Vec<u8>) {
        out.push(0x12); // variable specification
        out.push(0x0A); // remaining spec length
        out.push(0x10); // S7ANY addressing
        out.push(if self.is_bit { 0x01 } else { 0x02 }); // transport: BIT / BYTE
        let len = if self.is_bit { 1 } else { self.byte_len };
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.db.to_be_bytes());
        out.push(self.area);
        let addr = self.bit_address();
        out.push((addr >> 16) as u8);
        out.push((addr >> 8) as u8);
        out.push(addr as u8);
    }
}

/// TPKT + COTP data TPDU around an S7 payload
fn frame(payload: &[u8]) -> Vec<u8> {
    let total = (payload.len() + 7) as u16;
    let mut out = Vec::with_capacity(total as usize);
    out.extend_from_slice(&[0x03, 0x00]); // TPKT version 3
    out.extend_from_slice(&total.to_be_bytes());
    out.extend_from_slice(&[0x02, 0xF0, 0x80]); // COTP DT, EOT
    out.extend_from_slice(payload);
    out
}

/// COTP connection request carrying the PG TSAP for rack/slot
pub fn build_cotp_connect(rack: u16, slot: u16) -> Vec<u8> {
    let dst_tsap = [0x01, (rack * 0x20 + slot) as u8];
    let mut out = Vec::with_capacity(22);
    out.extend_from_slice(&[0x03, 0x00, 0x00, 0x16]); // TPKT, 22 bytes total
    out.push(0x11); // COTP length
    out.push(0xE0); // connection request
    out.extend_from_slice(&[0x00, 0x00]); // dst ref
    out.extend_from_slice(&[0x00, 0x01]); // src ref
    out.push(0x00); // class 0
    out.extend_from_slice(&[0xC0, 0x01, 0x0A]); // TPDU size 1024
    out.extend_from_slice(&[0xC1, 0x02, 0x01, 0x00]); // src TSAP
    out.extend_from_slice(&[0xC2, 0x02, dst_tsap[0], dst_tsap[1]]);
    out
}

/// S7 header for a job PDU
fn job_header(pdu_ref: u16, param_len: u16, data_len: u16, out: &mut Vec<u8>) {
    out.push(0x32); // S7 protocol id
    out.push(0x01); // ROSCTR: job
    out.extend_from_slice(&[0x00, 0x00]); // reserved
    out.extend_from_slice(&pdu_ref.to_be_bytes());
    out.extend_from_slice(&param_len.to_be_bytes());
    out.extend_from_slice(&data_len.to_be_bytes());
}

/// Setup-communication job negotiating the PDU size
pub fn build_setup(pdu_ref: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(18);
    job_header(pdu_ref, 8, 0, &mut payload);
    payload.push(0xF0); // function: setup communication
    payload.push(0x00);
    payload.extend_from_slice(&1u16.to_be_bytes()); // max AMQ calling
    payload.extend_from_slice(&1u16.to_be_bytes()); // max AMQ called
    payload.extend_from_slice(&REQUESTED_PDU_SIZE.to_be_bytes());
    frame(&payload)
}

/// Read-var job for up to [`MAX_ITEMS_PER_READ`] items
pub fn build_read(pdu_ref: u16, items: &[S7Item]) -> Vec<u8> {
    let param_len = (2 + items.len() * 12) as u16;
    let mut payload = Vec::with_capacity(10 + param_len as usize);
    job_header(pdu_ref, param_len, 0, &mut payload);
    payload.push(0x04); // function: read var
    payload.push(items.len() as u8);
    for item in items {
        item.encode_spec(&mut payload);
    }
    frame(&payload)
}

/// Write-var job for a single item
pub fn build_write(pdu_ref: u16, item: &S7Item, data: &[u8]) -> Vec<u8> {
    let param_len = 14u16;
    let data_len = (4 + data.len()) as u16;
    let mut payload = Vec::with_capacity(10 + param_len as usize + data_len as usize);
    job_header(pdu_ref, param_len, data_len, &mut payload);
    payload.push(0x05); // function: write var
    payload.push(0x01);
    item.encode_spec(&mut payload);
    // data part
    payload.push(0x00); // reserved
    if item.is_bit {
        payload.push(0x03); // transport: BIT
        payload.extend_from_slice(&1u16.to_be_bytes());
    } else {
        payload.push(0x04); // transport: BYTE/WORD/DWORD, length in bits
        payload.extend_from_slice(&((data.len() * 8) as u16).to_be_bytes());
    }
    payload.extend_from_slice(data);
    frame(&payload)
}

/// Strip TPKT + COTP and validate the S7 ack-data header; returns the bytes
/// after the header (parameters + data) and the function code
fn parse_ack(frame: &[u8]) -> Result<(u8, &[u8]), ProtocolError> {
    if frame.len() < 19 {
        return Err(ProtocolError::ReadFailed("short S7 response".into()));
    }
    let s7 = &frame[7..]; // 4 TPKT + 3 COTP
    if s7[0] != 0x32 {
        return Err(ProtocolError::ReadFailed("not an S7 PDU".into()));
    }
    if s7[1] != 0x03 {
        return Err(ProtocolError::ReadFailed(format!(
            "unexpected ROSCTR {:#04x}",
            s7[1]
        )));
    }
    let error_class = s7[10];
    let error_code = s7[11];
    if error_class != 0 || error_code != 0 {
        return Err(ProtocolError::ReadFailed(format!(
            "PLC error class {error_class:#04x} code {error_code:#04x}"
        )));
    }
    Ok((s7[12], &s7[13..]))
}

/// Negotiated PDU size from a setup-communication ack
pub fn parse_setup_ack(frame: &[u8]) -> Result<u16, ProtocolError> {
    let (function, rest) = parse_ack(frame)?;
    if function != 0xF0 || rest.len() < 7 {
        return Err(ProtocolError::ConnectionFailed(
            "malformed setup-communication ack".into(),
        ));
    }
    Ok(u16::from_be_bytes([rest[5], rest[6]]))
}

/// Per-item payloads from a read-var ack. `Err(code)` carries the PLC's
/// return code for items it rejected.
pub fn parse_read_ack(
    frame: &[u8],
    expected_items: usize,
) -> Result<Vec<Result<Vec<u8>, u8>>, ProtocolError> {
    let (function, rest) = parse_ack(frame)?;
    if function != 0x04 || rest.is_empty() {
        return Err(ProtocolError::ReadFailed("malformed read-var ack".into()));
    }
    let item_count = rest[0] as usize;
    if item_count != expected_items {
        return Err(ProtocolError::ReadFailed(format!(
            "expected {expected_items} items, PLC answered {item_count}"
        )));
    }

    let mut results = Vec::with_capacity(item_count);
    let mut cursor = 1usize;
    for i in 0..item_count {
        if cursor + 4 > rest.len() {
            return Err(ProtocolError::ReadFailed("truncated read-var ack".into()));
        }
        let code = rest[cursor];
        let transport = rest[cursor + 1];
        let length = u16::from_be_bytes([rest[cursor + 2], rest[cursor + 3]]) as usize;
        cursor += 4;

        if code != retcode::SUCCESS {
            results.push(Err(code));
            continue;
        }
        // transport 0x03/0x04/0x05 report the length in bits
        let byte_len = match transport {
            0x03 => 1,
            0x04 | 0x05 => length / 8,
            _ => length,
        };
        if cursor + byte_len > rest.len() {
            return Err(ProtocolError::ReadFailed("truncated item data".into()));
        }
        results.push(Ok(rest[cursor..cursor + byte_len].to_vec()));
        cursor += byte_len;
        // odd-length items are padded to even, except the last
        if byte_len % 2 == 1 && i + 1 < item_count {
            cursor += 1;
        }
    }
    Ok(results)
}

/// Check the single-item return code of a write-var ack
pub fn parse_write_ack(frame: &[u8]) -> Result<(), ProtocolError> {
    let (function, rest) = parse_ack(frame)?;
    if function != 0x05 || rest.len() < 2 {
        return Err(ProtocolError::WriteFailed("malformed write-var ack".into()));
    }
    match rest[1] {
        retcode::SUCCESS => Ok(()),
        code => Err(ProtocolError::WriteFailed(format!(
            "PLC rejected write, return code {code:#04x}"
        ))),
    }
}

/// Blocking-free S7 client over one TCP socket
pub struct S7Client {
    stream: TcpStream,
    pdu_size: u16,
    pdu_ref: u16,
    io_timeout: Duration,
}

impl S7Client {
    /// COTP connect + S7 setup-communication handshake
    pub async fn connect(
        host: &str,
        port: u16,
        rack: u16,
        slot: u16,
        io_timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let addr = format!("{host}:{port}");
        let stream = timeout(io_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::ConnectionFailed(format!("{addr}: {e}")))?;
        stream
            .set_nodelay(true)
            .map_err(|e| ProtocolError::ConnectionFailed(e.to_string()))?;

        let mut client = Self {
            stream,
            pdu_size: REQUESTED_PDU_SIZE,
            pdu_ref: 0,
            io_timeout,
        };

        let response = client.exchange(&build_cotp_connect(rack, slot)).await?;
        // COTP connection confirm
        if response.len() < 6 || response[5] != 0xD0 {
            return Err(ProtocolError::ConnectionFailed(
                "COTP connection refused".into(),
            ));
        }

        let pdu_ref = client.next_ref();
        let response = client.exchange(&build_setup(pdu_ref)).await?;
        client.pdu_size = parse_setup_ack(&response)?;
        info!(
            endpoint = %addr,
            rack,
            slot,
            pdu_size = client.pdu_size,
            "S7 connection established"
        );
        Ok(client)
    }

    pub fn pdu_size(&self) -> u16 {
        self.pdu_size
    }

    fn next_ref(&mut self) -> u16 {
        self.pdu_ref = self.pdu_ref.wrapping_add(1);
        self.pdu_ref
    }

    /// Items whose combined response fits the negotiated PDU
    pub fn fits_in_pdu(&self, items: &[S7Item], extra: &S7Item) -> bool {
        if items.len() + 1 > MAX_ITEMS_PER_READ {
            return false;
        }
        let request: usize = 12 + (items.len() + 1) * 12;
        let response: usize = 14
            + items
                .iter()
                .chain(std::iter::once(extra))
                .map(|i| 4 + if i.is_bit { 2 } else { i.byte_len as usize + 1 })
                .sum::<usize>();
        request < self.pdu_size as usize && response < self.pdu_size as usize
    }

    pub async fn read_items(
        &mut self,
        items: &[S7Item],
    ) -> Result<Vec<Result<Vec<u8>, u8>>, ProtocolError> {
        let pdu_ref = self.next_ref();
        let response = self.exchange(&build_read(pdu_ref, items)).await?;
        parse_read_ack(&response, items.len())
    }

    pub async fn write_item(&mut self, item: &S7Item, data: &[u8]) -> Result<(), ProtocolError> {
        let pdu_ref = self.next_ref();
        let response = self.exchange(&build_write(pdu_ref, item, data)).await?;
        parse_write_ack(&response)
    }

    pub async fn shutdown(&mut self) {
        let _ = self.stream.shutdown().await;
    }

    /// One request/response round trip, TPKT-framed on both sides
    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        timeout(self.io_timeout, self.stream.write_all(request))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))?;

        let mut header = [0u8; 4];
        timeout(self.io_timeout, self.stream.read_exact(&mut header))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))?;
        if header[0] != 0x03 {
            return Err(ProtocolError::ConnectionLost(
                "bad TPKT version from peer".into(),
            ));
        }
        let total = u16::from_be_bytes([header[2], header[3]]) as usize;
        if total < 4 || total > 8192 {
            return Err(ProtocolError::ConnectionLost(format!(
                "implausible TPKT length {total}"
            )));
        }
        let mut body = vec![0u8; total - 4];
        timeout(self.io_timeout, self.stream.read_exact(&mut body))
            .await
            .map_err(|_| ProtocolError::Timeout)?
            .map_err(|e| ProtocolError::ConnectionLost(e.to_string()))?;

        let mut full = header.to_vec();
        full.extend_from_slice(&body);
        debug!(bytes = full.len(), "S7 frame received");
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_word(db: u16, offset: u32) -> S7Item {
        S7Item {
            area: area::DATA_BLOCK,
            db,
            byte_offset: offset,
            bit: 0,
            is_bit: false,
            byte_len: 2,
        }
    }

    /// Assemble an ack-data frame around the given params+data bytes
    fn ack_frame(function: u8, body: &[u8]) -> Vec<u8> {
        let mut s7 = vec![0x32, 0x03, 0x00, 0x00, 0x00, 0x01];
        s7.extend_from_slice(&[(0u16 >> 8) as u8, 0]); // param length (unchecked)
        s7.extend_from_slice(&[0, 0]); // data length (unchecked)
        s7.extend_from_slice(&[0x00, 0x00]); // error class/code
        s7.push(function);
        s7.extend_from_slice(body);
        let mut out = vec![0x03, 0x00];
        out.extend_from_slice(&((s7.len() + 7) as u16).to_be_bytes());
        out.extend_from_slice(&[0x02, 0xF0, 0x80]);
        out.extend_from_slice(&s7);
        out
    }

    #[test]
    fn test_cotp_connect_tsap_encodes_rack_slot() {
        let frame = build_cotp_connect(0, 2);
        assert_eq!(frame[1 + 4], 0xE0); // connection request
        assert_eq!(frame.len(), 22);
        // dst TSAP is the last parameter
        assert_eq!(&frame[18..], &[0xC2, 0x02, 0x01, 0x02]);

        let frame = build_cotp_connect(1, 3);
        assert_eq!(&frame[18..], &[0xC2, 0x02, 0x01, 0x23]);
    }

    #[test]
    fn test_read_request_layout() {
        let items = [db_word(5, 20)];
        let frame = build_read(1, &items);
        // TPKT length matches the whole frame
        assert_eq!(
            u16::from_be_bytes([frame[2], frame[3]]) as usize,
            frame.len()
        );
        let s7 = &frame[7..];
        assert_eq!(s7[0], 0x32);
        assert_eq!(s7[1], 0x01); // job
        assert_eq!(u16::from_be_bytes([s7[6], s7[7]]), 14); // param length
        assert_eq!(s7[10], 0x04); // read var
        assert_eq!(s7[11], 1); // item count
        let spec = &s7[12..24];
        assert_eq!(spec[0], 0x12);
        assert_eq!(spec[3], 0x02); // BYTE transport
        assert_eq!(u16::from_be_bytes([spec[4], spec[5]]), 2); // byte length
        assert_eq!(u16::from_be_bytes([spec[6], spec[7]]), 5); // DB number
        assert_eq!(spec[8], area::DATA_BLOCK);
        // bit address = 20 * 8 = 160
        assert_eq!(
            u32::from_be_bytes([0, spec[9], spec[10], spec[11]]),
            160
        );
    }

    #[test]
    fn test_bit_item_spec() {
        let item = S7Item {
            area: area::MERKER,
            db: 0,
            byte_offset: 10,
            bit: 3,
            is_bit: true,
            byte_len: 1,
        };
        let frame = build_read(1, &[item]);
        let spec = &frame[7 + 12..7 + 24];
        assert_eq!(spec[3], 0x01); // BIT transport
        assert_eq!(u32::from_be_bytes([0, spec[9], spec[10], spec[11]]), 83);
    }

    #[test]
    fn test_parse_read_ack_success_and_error() {
        // two items: a word (0xFF, transport 0x04, 16 bits) and a rejected one
        let body = [
            2u8, // item count
            0xFF, 0x04, 0x00, 0x10, 0x03, 0x4D, // item 1: 0x034D
            0x0A, 0x00, 0x00, 0x00, // item 2: object does not exist
        ];
        let frame = ack_frame(0x04, &body);
        let results = parse_read_ack(&frame, 2).unwrap();
        assert_eq!(results[0], Ok(vec![0x03, 0x4D]));
        assert_eq!(results[1], Err(retcode::OBJECT_DOES_NOT_EXIST));
    }

    #[test]
    fn test_parse_read_ack_item_count_mismatch() {
        let body = [1u8, 0xFF, 0x04, 0x00, 0x10, 0x00, 0x01];
        let frame = ack_frame(0x04, &body);
        assert!(parse_read_ack(&frame, 2).is_err());
    }

    #[test]
    fn test_parse_write_ack() {
        assert!(parse_write_ack(&ack_frame(0x05, &[1, retcode::SUCCESS])).is_ok());
        assert!(parse_write_ack(&ack_frame(0x05, &[1, retcode::OUT_OF_RANGE])).is_err());
    }

    #[test]
    fn test_parse_ack_surfaces_plc_error() {
        let mut frame = ack_frame(0x04, &[0]);
        // poke the error class byte
        frame[7 + 10] = 0x85;
        assert!(parse_read_ack(&frame, 0).is_err());
    }

    #[test]
    fn test_setup_ack_round_trip() {
        // function 0xF0, body mirrors the request: f0 00, amq, amq, pdu size
        let body = [0x00, 0x00, 0x01, 0x00, 0x01, 0x01, 0xE0];
        let frame = ack_frame(0xF0, &body);
        assert_eq!(parse_setup_ack(&frame).unwrap(), 480);
    }
}
