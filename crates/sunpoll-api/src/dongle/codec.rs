// ── Dongle frame codec ──
//
// The WiFi datalogger wraps a Modbus-like PDU in its own TCP envelope:
//
//   A1 1A | proto u16 | len u16 | 01 | tcp fn | datalogger[10] | dlen u16 | data
//
// All multi-byte fields are little-endian. `len` counts every byte after
// itself. For translated-data frames (`tcp fn` 0xC2) `data` carries
//
//   addr | fn | inverter[10] | register u16 | count u16 | crc16
//
// on requests, and `addr | fn | inverter[10] | register u16 | nbytes | values`
// followed by the CRC on read replies. The CRC is CRC-16/MODBUS over the
// data section, little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_16_MODBUS, Crc};

use crate::error::Error;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub const PREFIX: [u8; 2] = [0xA1, 0x1A];
pub const PROTOCOL: u16 = 2;
pub const SERIAL_LEN: usize = 10;

/// TCP-level function: keep-alive sent by the dongle on its own.
pub const TCP_HEARTBEAT: u8 = 0xC1;
/// TCP-level function: translated Modbus data.
pub const TCP_TRANSLATED: u8 = 0xC2;

pub const READ_HOLDING: u8 = 0x03;
pub const READ_INPUT: u8 = 0x04;
pub const WRITE_SINGLE: u8 = 0x06;

/// Bytes before the data section.
const HEADER_LEN: usize = 2 + 2 + 2 + 1 + 1 + SERIAL_LEN + 2;
/// Largest frame accepted; guards against a garbage length field.
const MAX_FRAME_LEN: usize = 1024;

/// Compute the CRC of a data section.
pub fn checksum(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Pad or truncate a serial to its fixed 10-byte field.
pub fn serial_field(serial: &str) -> [u8; SERIAL_LEN] {
    let mut field = [0u8; SERIAL_LEN];
    for (slot, byte) in field.iter_mut().zip(serial.bytes()) {
        *slot = byte;
    }
    field
}

fn serial_text(field: &[u8]) -> String {
    field
        .iter()
        .copied()
        .filter(u8::is_ascii_graphic)
        .map(char::from)
        .collect()
}

/// A request for one block of registers, or a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub function: u8,
    pub inverter: String,
    pub register: u16,
    /// Register count for reads, the value for a single write.
    pub operand: u16,
}

/// One envelope received from the dongle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tcp_function: u8,
    pub datalogger: String,
    pub data: Bytes,
}

/// A decoded translated-data reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub function: u8,
    pub inverter: String,
    pub register: u16,
    pub values: Vec<u16>,
}

/// Encode a translated-data request addressed through `datalogger`.
pub fn encode_request(datalogger: &str, request: &Request) -> Bytes {
    let mut data = BytesMut::with_capacity(2 + SERIAL_LEN + 4 + 2);
    data.put_u8(0);
    data.put_u8(request.function);
    data.put_slice(&serial_field(&request.inverter));
    data.put_u16_le(request.register);
    data.put_u16_le(request.operand);
    let crc = checksum(&data);
    data.put_u16_le(crc);

    let mut frame = BytesMut::with_capacity(HEADER_LEN + data.len());
    frame.put_slice(&PREFIX);
    frame.put_u16_le(PROTOCOL);
    let after_len = HEADER_LEN - 6 + data.len();
    frame.put_u16_le(u16::try_from(after_len).unwrap_or(u16::MAX));
    frame.put_u8(1);
    frame.put_u8(TCP_TRANSLATED);
    frame.put_slice(&serial_field(datalogger));
    frame.put_u16_le(u16::try_from(data.len()).unwrap_or(u16::MAX));
    frame.put_slice(&data);
    frame.freeze()
}

/// Pull one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` when more bytes are needed. Bytes before a valid
/// prefix are discarded.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>, Error> {
    // Resync on the prefix.
    match buf.windows(2).position(|w| w == PREFIX) {
        Some(0) => {}
        Some(skip) => buf.advance(skip),
        None => {
            let keep = usize::from(buf.last() == Some(&PREFIX[0]));
            let drop = buf.len() - keep;
            buf.advance(drop);
            return Ok(None);
        }
    }
    if buf.len() < 6 {
        return Ok(None);
    }
    let after_len = usize::from(u16::from_le_bytes([buf[4], buf[5]]));
    let total = 6 + after_len;
    if total < HEADER_LEN || total > MAX_FRAME_LEN {
        buf.advance(2);
        return Err(Error::read(format!("implausible dongle frame length {after_len}")));
    }
    if buf.len() < total {
        return Ok(None);
    }

    let mut frame = buf.split_to(total);
    frame.advance(6);
    let _address = frame.get_u8();
    let tcp_function = frame.get_u8();
    let datalogger = serial_text(&frame.split_to(SERIAL_LEN));
    let data_len = usize::from(frame.get_u16_le());
    if data_len > frame.len() {
        return Err(Error::read(format!(
            "dongle data length {data_len} exceeds frame ({} bytes left)",
            frame.len()
        )));
    }
    let data = frame.split_to(data_len).freeze();

    Ok(Some(Frame {
        tcp_function,
        datalogger,
        data,
    }))
}

/// Parse the data section of a translated-data reply and check its CRC.
pub fn parse_reply(data: &[u8]) -> Result<Reply, Error> {
    const MIN: usize = 2 + SERIAL_LEN + 2 + 2;
    if data.len() < MIN {
        return Err(Error::read(format!("dongle reply too short: {} bytes", data.len())));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 2);
    let received = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected = checksum(body);
    if received != expected {
        return Err(Error::read(format!(
            "CRC mismatch: expected 0x{expected:04X}, got 0x{received:04X}"
        )));
    }

    let mut body = body;
    let _address = body.get_u8();
    let function = body.get_u8();
    let inverter = serial_text(&body[..SERIAL_LEN]);
    body.advance(SERIAL_LEN);
    let register = body.get_u16_le();

    if function & 0x80 != 0 {
        let code = body.first().copied().unwrap_or_default();
        return Err(Error::read(format!(
            "device answered function 0x{:02X} with exception {code}",
            function & 0x7F
        )));
    }

    let values = match function {
        READ_HOLDING | READ_INPUT => {
            if body.is_empty() {
                return Err(Error::read("dongle reply missing byte count"));
            }
            let byte_count = usize::from(body.get_u8());
            if byte_count % 2 != 0 || body.len() < byte_count {
                return Err(Error::read(format!(
                    "dongle reply byte count {byte_count} does not match payload {}",
                    body.len()
                )));
            }
            body[..byte_count]
                .chunks_exact(2)
                .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                .collect()
        }
        WRITE_SINGLE => {
            if body.len() < 2 {
                return Err(Error::read("write echo missing value"));
            }
            vec![body.get_u16_le()]
        }
        other => {
            return Err(Error::read(format!("unexpected dongle function 0x{other:02X}")));
        }
    };

    Ok(Reply {
        function,
        inverter,
        register,
        values,
    })
}

/// Build a reply frame the way the dongle does.
#[cfg(test)]
pub(crate) fn encode_reply(datalogger: &str, inverter: &str, function: u8, register: u16, values: &[u16]) -> Bytes {
    let mut data = BytesMut::new();
    data.put_u8(0);
    data.put_u8(function);
    data.put_slice(&serial_field(inverter));
    data.put_u16_le(register);
    if function == WRITE_SINGLE {
        data.put_u16_le(values.first().copied().unwrap_or_default());
    } else {
        data.put_u8(u8::try_from(values.len() * 2).unwrap_or(u8::MAX));
        for v in values {
            data.put_u16_le(*v);
        }
    }
    let crc = checksum(&data);
    data.put_u16_le(crc);

    let mut frame = BytesMut::new();
    frame.put_slice(&PREFIX);
    frame.put_u16_le(PROTOCOL);
    frame.put_u16_le(u16::try_from(HEADER_LEN - 6 + data.len()).unwrap_or(u16::MAX));
    frame.put_u8(1);
    frame.put_u8(TCP_TRANSLATED);
    frame.put_slice(&serial_field(datalogger));
    frame.put_u16_le(u16::try_from(data.len()).unwrap_or(u16::MAX));
    frame.put_slice(&data);
    frame.freeze()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn crc_matches_modbus_reference() {
        assert_eq!(checksum(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn request_layout() {
        let frame = encode_request(
            "BA12345678",
            &Request {
                function: READ_INPUT,
                inverter: "4512345678".into(),
                register: 40,
                operand: 28,
            },
        );
        assert_eq!(&frame[..2], &PREFIX);
        assert_eq!(usize::from(u16::from_le_bytes([frame[4], frame[5]])), frame.len() - 6);
        assert_eq!(frame[7], TCP_TRANSLATED);
        assert_eq!(&frame[8..18], b"BA12345678");
        let data = &frame[HEADER_LEN..];
        assert_eq!(data[1], READ_INPUT);
        assert_eq!(&data[2..12], b"4512345678");
        assert_eq!(u16::from_le_bytes([data[12], data[13]]), 40);
        assert_eq!(u16::from_le_bytes([data[14], data[15]]), 28);
        let crc = u16::from_le_bytes([data[16], data[17]]);
        assert_eq!(crc, checksum(&data[..16]));
    }

    #[test]
    fn reply_decodes_after_leading_garbage() {
        let reply = encode_reply("BA12345678", "4512345678", READ_INPUT, 0, &[7, 0x1234, 65535]);
        let mut buf = BytesMut::from(&[0x00, 0xFF, 0x13][..]);
        buf.extend_from_slice(&reply);

        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        assert_eq!(frame.tcp_function, TCP_TRANSLATED);
        assert_eq!(frame.datalogger, "BA12345678");

        let parsed = parse_reply(&frame.data).unwrap();
        assert_eq!(parsed.inverter, "4512345678");
        assert_eq!(parsed.values, vec![7, 0x1234, 65535]);
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let reply = encode_reply("BA12345678", "4512345678", READ_HOLDING, 21, &[1, 2]);
        let mut buf = BytesMut::from(&reply[..reply.len() - 3]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&reply[reply.len() - 3..]);
        assert!(decode_frame(&mut buf).unwrap().is_some());
    }

    #[test]
    fn corrupted_crc_is_rejected() {
        let reply = encode_reply("BA12345678", "4512345678", READ_INPUT, 0, &[1, 2, 3]);
        let mut buf = BytesMut::from(&reply[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        let mut data = frame.data.to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let err = parse_reply(&data).unwrap_err();
        assert!(err.to_string().contains("CRC mismatch"));
    }

    #[test]
    fn write_echo_carries_value() {
        let reply = encode_reply("BA12345678", "4512345678", WRITE_SINGLE, 64, &[80]);
        let mut buf = BytesMut::from(&reply[..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        let parsed = parse_reply(&frame.data).unwrap();
        assert_eq!(parsed.register, 64);
        assert_eq!(parsed.values, vec![80]);
    }
}
