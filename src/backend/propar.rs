use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use serialport::{ClearBuffer, SerialPort};
use tracing::trace;

use crate::backend::Backend;
use crate::constants::{
    PARAM_ALARM_ABOVE, PARAM_ALARM_BELOW, PARAM_ALARM_DELAY, PARAM_ALARM_MODE,
    PARAM_ALARM_SETPOINT_TRACKING, PARAM_CAPACITY, PARAM_CAPACITY_UNIT, PARAM_CONTROL_MODE,
    PARAM_MEASURE, PARAM_SERIAL_NUMBER, PARAM_SETPOINT, PARAM_STATUS, PARAM_USER_TAG,
    PARAM_VALVE_OUTPUT,
};
use crate::data::{ParamValue, ParameterAddress};
use crate::error::TransportError;
use crate::frame::{decode_frame, encode_frame};

const CMD_STATUS: u8 = 0x00;
const CMD_SEND_WITH_STATUS: u8 = 0x01;
const CMD_ANSWER: u8 = 0x02;
const CMD_REQUEST: u8 = 0x04;

const TYPE_MASK: u8 = 0x60;
const PARAM_MASK: u8 = 0x1F;
const PROCESS_MASK: u8 = 0x7F;
const MAX_LINE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParamKind {
    U8,
    U16,
    U32,
    F32,
    Text,
}

impl ParamKind {
    const fn type_code(self) -> u8 {
        match self {
            Self::U8 => 0x00,
            Self::U16 => 0x20,
            Self::U32 | Self::F32 => 0x40,
            Self::Text => 0x60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParamLocation {
    pub process: u8,
    pub parameter: u8,
    pub kind: ParamKind,
}

impl ParamLocation {
    const fn new(process: u8, parameter: u8, kind: ParamKind) -> Self {
        Self {
            process,
            parameter,
            kind,
        }
    }

    const fn index_byte(self) -> u8 {
        self.kind.type_code() | (self.parameter & PARAM_MASK)
    }
}

pub(crate) fn locate(address: ParameterAddress) -> Option<ParamLocation> {
    let location = match address {
        PARAM_SERIAL_NUMBER => ParamLocation::new(113, 3, ParamKind::Text),
        PARAM_MEASURE => ParamLocation::new(1, 0, ParamKind::U16),
        PARAM_SETPOINT => ParamLocation::new(1, 1, ParamKind::U16),
        PARAM_CONTROL_MODE => ParamLocation::new(1, 4, ParamKind::U8),
        PARAM_CAPACITY => ParamLocation::new(1, 13, ParamKind::F32),
        PARAM_STATUS => ParamLocation::new(1, 20, ParamKind::U8),
        PARAM_VALVE_OUTPUT => ParamLocation::new(114, 1, ParamKind::U32),
        PARAM_ALARM_ABOVE => ParamLocation::new(97, 1, ParamKind::U16),
        PARAM_ALARM_BELOW => ParamLocation::new(97, 2, ParamKind::U16),
        PARAM_ALARM_MODE => ParamLocation::new(97, 3, ParamKind::U8),
        PARAM_ALARM_SETPOINT_TRACKING => ParamLocation::new(97, 5, ParamKind::U8),
        PARAM_CAPACITY_UNIT => ParamLocation::new(1, 31, ParamKind::Text),
        PARAM_USER_TAG => ParamLocation::new(113, 6, ParamKind::Text),
        PARAM_ALARM_DELAY => ParamLocation::new(97, 7, ParamKind::U8),
        _ => return None,
    };
    Some(location)
}

pub(crate) struct ProparBackend {
    port: Box<dyn SerialPort>,
    node: u8,
    io_timeout: Duration,
}

impl ProparBackend {
    pub(crate) fn new(
        path: &str,
        baud: u32,
        node: u8,
        io_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud).timeout(io_timeout).open()?;
        Ok(Self {
            port,
            node,
            io_timeout,
        })
    }

    fn transact(&mut self, body: &[u8]) -> Result<Option<Vec<u8>>, TransportError> {
        let request = encode_frame(body)?;
        self.port.clear(ClearBuffer::Input)?;
        self.port.write_all(&request)?;
        self.port.flush()?;
        trace!(request = %String::from_utf8_lossy(&request).trim_end(), "propar request");

        let Some(line) = self.read_line()? else {
            return Ok(None);
        };
        trace!(answer = %String::from_utf8_lossy(&line).trim_end(), "propar answer");
        decode_frame(&line).map(Some)
    }

    fn read_line(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        let deadline = Instant::now() + self.io_timeout * 2;
        let mut line = Vec::with_capacity(32);
        let mut byte = [0u8; 1];

        loop {
            if Instant::now() >= deadline {
                return truncated_or_silent(line);
            }
            match self.port.read(&mut byte) {
                Ok(0) => {}
                Ok(_) => {
                    if line.is_empty() && byte[0] != b':' {
                        continue;
                    }
                    line.push(byte[0]);
                    if byte[0] == b'\n' {
                        return Ok(Some(line));
                    }
                    if line.len() > MAX_LINE {
                        return Err(TransportError::Frame("answer exceeds line limit".into()));
                    }
                }
                Err(err) if err.kind() == ErrorKind::TimedOut => {
                    return truncated_or_silent(line);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }
}

fn truncated_or_silent(line: Vec<u8>) -> Result<Option<Vec<u8>>, TransportError> {
    if line.is_empty() {
        Ok(None)
    } else {
        Err(TransportError::Frame(format!(
            "truncated answer after {} bytes",
            line.len()
        )))
    }
}

impl Backend for ProparBackend {
    fn read_parameter(
        &mut self,
        address: ParameterAddress,
    ) -> Result<Option<ParamValue>, TransportError> {
        let location = locate(address).ok_or(TransportError::Unmapped(address))?;
        let request = build_read_request(self.node, location);
        match self.transact(&request)? {
            Some(answer) => parse_read_answer(&answer, location),
            None => Ok(None),
        }
    }

    fn write_parameter(
        &mut self,
        address: ParameterAddress,
        value: &ParamValue,
    ) -> Result<(), TransportError> {
        let location = locate(address).ok_or(TransportError::Unmapped(address))?;
        let request = build_write_request(self.node, address, location, value)?;
        let answer = self.transact(&request)?.ok_or(TransportError::NoResponse)?;
        parse_write_status(&answer)
    }
}

fn build_read_request(node: u8, location: ParamLocation) -> Vec<u8> {
    let process = location.process & PROCESS_MASK;
    let index = location.index_byte();
    let mut body = vec![node, CMD_REQUEST, process, index, process, index];
    if location.kind == ParamKind::Text {
        body.push(0x00);
    }
    body
}

fn build_write_request(
    node: u8,
    address: ParameterAddress,
    location: ParamLocation,
    value: &ParamValue,
) -> Result<Vec<u8>, TransportError> {
    let mut body = vec![
        node,
        CMD_SEND_WITH_STATUS,
        location.process & PROCESS_MASK,
        location.index_byte(),
    ];
    body.extend_from_slice(&encode_value(address, location.kind, value)?);
    Ok(body)
}

fn parse_read_answer(
    body: &[u8],
    location: ParamLocation,
) -> Result<Option<ParamValue>, TransportError> {
    if body.len() < 3 {
        return Err(TransportError::Frame("answer too short".into()));
    }
    match body[1] {
        CMD_STATUS => {
            trace!(status = body[2], "read answered with status only");
            Ok(None)
        }
        CMD_ANSWER => {
            if body.len() < 4 {
                return Err(TransportError::Frame("answer without parameter index".into()));
            }
            if body[2] & PROCESS_MASK != location.process & PROCESS_MASK
                || body[3] & PARAM_MASK != location.parameter & PARAM_MASK
            {
                return Err(TransportError::Frame(format!(
                    "answer for process {} parameter {}, expected {} / {}",
                    body[2] & PROCESS_MASK,
                    body[3] & PARAM_MASK,
                    location.process,
                    location.parameter
                )));
            }
            if body[3] & TYPE_MASK != location.kind.type_code() {
                return Err(TransportError::Frame(format!(
                    "answer type 0x{:02X} does not match 0x{:02X}",
                    body[3] & TYPE_MASK,
                    location.kind.type_code()
                )));
            }
            decode_value(location.kind, &body[4..]).map(Some)
        }
        other => Err(TransportError::Frame(format!(
            "unexpected command 0x{other:02X} in read answer"
        ))),
    }
}

fn parse_write_status(body: &[u8]) -> Result<(), TransportError> {
    if body.len() < 3 || body[1] != CMD_STATUS {
        return Err(TransportError::Frame("write not answered with status".into()));
    }
    match body[2] {
        0 => Ok(()),
        status => Err(TransportError::Status { status }),
    }
}

fn encode_value(
    address: ParameterAddress,
    kind: ParamKind,
    value: &ParamValue,
) -> Result<Vec<u8>, TransportError> {
    let reject = || TransportError::Encode {
        address,
        value: value.to_string(),
    };
    match kind {
        ParamKind::U8 => {
            let raw = value.as_integer().ok_or_else(reject)?;
            Ok(vec![u8::try_from(raw).map_err(|_| reject())?])
        }
        ParamKind::U16 => {
            let raw = value.as_integer().ok_or_else(reject)?;
            Ok(u16::try_from(raw).map_err(|_| reject())?.to_be_bytes().to_vec())
        }
        ParamKind::U32 => {
            let raw = value.as_integer().ok_or_else(reject)?;
            Ok(u32::try_from(raw).map_err(|_| reject())?.to_be_bytes().to_vec())
        }
        ParamKind::F32 => {
            #[allow(clippy::cast_possible_truncation)]
            let raw = value.as_float().ok_or_else(reject)? as f32;
            Ok(raw.to_be_bytes().to_vec())
        }
        ParamKind::Text => {
            let ParamValue::Text(text) = value else {
                return Err(reject());
            };
            let len = u8::try_from(text.len()).map_err(|_| reject())?;
            let mut out = Vec::with_capacity(text.len() + 1);
            out.push(len);
            out.extend_from_slice(text.as_bytes());
            Ok(out)
        }
    }
}

fn decode_value(kind: ParamKind, data: &[u8]) -> Result<ParamValue, TransportError> {
    let short = |need: usize| {
        TransportError::Frame(format!("expected {need} data bytes, got {}", data.len()))
    };
    match kind {
        ParamKind::U8 => data
            .first()
            .map(|value| ParamValue::Integer(i64::from(*value)))
            .ok_or_else(|| short(1)),
        ParamKind::U16 => match data {
            [hi, lo, ..] => Ok(ParamValue::Integer(i64::from(u16::from_be_bytes([*hi, *lo])))),
            _ => Err(short(2)),
        },
        ParamKind::U32 => match data {
            [a, b, c, d, ..] => Ok(ParamValue::Integer(i64::from(u32::from_be_bytes([
                *a, *b, *c, *d,
            ])))),
            _ => Err(short(4)),
        },
        ParamKind::F32 => match data {
            [a, b, c, d, ..] => Ok(ParamValue::Float(f64::from(f32::from_be_bytes([
                *a, *b, *c, *d,
            ])))),
            _ => Err(short(4)),
        },
        ParamKind::Text => Ok(decode_text(data)),
    }
}

fn decode_text(data: &[u8]) -> ParamValue {
    let Some((&len, payload)) = data.split_first() else {
        return ParamValue::Text(String::new());
    };
    let payload = if len == 0 {
        payload.split(|byte| *byte == 0).next().unwrap_or_default()
    } else {
        &payload[..usize::from(len).min(payload.len())]
    };
    let payload = payload.strip_suffix(&[0]).unwrap_or(payload);
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => ParamValue::Text(text),
        Err(err) => ParamValue::Bytes(err.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::{
        CMD_ANSWER, CMD_REQUEST, CMD_SEND_WITH_STATUS, CMD_STATUS, ParamKind, build_read_request,
        build_write_request, decode_value, locate, parse_read_answer, parse_write_status,
    };
    use crate::constants::{
        PARAM_CAPACITY, PARAM_CAPACITY_UNIT, PARAM_CONTROL_MODE, PARAM_MEASURE, PARAM_SETPOINT,
        PARAM_VALVE_OUTPUT,
    };
    use crate::data::{ParamValue, ParameterAddress};
    use crate::error::TransportError;

    #[test]
    fn every_known_address_has_a_location() {
        for address in [1u16, 8, 9, 12, 21, 28, 55, 116, 117, 118, 120, 129, 130, 182] {
            assert!(locate(ParameterAddress(address)).is_some(), "{address} unmapped");
        }
        assert!(locate(ParameterAddress(7)).is_none());
    }

    #[test]
    fn builds_measure_request() {
        let location = locate(PARAM_MEASURE).expect("measure is mapped");
        let body = build_read_request(0x80, location);
        assert_eq!(body, vec![0x80, CMD_REQUEST, 0x01, 0x20, 0x01, 0x20]);
    }

    #[test]
    fn string_requests_carry_length_byte() {
        let location = locate(PARAM_CAPACITY_UNIT).expect("unit is mapped");
        let body = build_read_request(0x03, location);
        assert_eq!(body, vec![0x03, CMD_REQUEST, 0x01, 0x7F, 0x01, 0x7F, 0x00]);
    }

    #[test]
    fn builds_setpoint_write() {
        let location = locate(PARAM_SETPOINT).expect("setpoint is mapped");
        let body = build_write_request(0x80, PARAM_SETPOINT, location, &ParamValue::Integer(16_000))
            .expect("write should build");
        assert_eq!(body, vec![0x80, CMD_SEND_WITH_STATUS, 0x01, 0x21, 0x3E, 0x80]);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let location = locate(PARAM_CONTROL_MODE).expect("mode is mapped");
        let err = build_write_request(0x80, PARAM_CONTROL_MODE, location, &ParamValue::Integer(300))
            .expect_err("300 does not fit a byte");
        assert!(matches!(err, TransportError::Encode { .. }));
    }

    #[test]
    fn parses_measure_answer() {
        let location = locate(PARAM_MEASURE).expect("measure is mapped");
        let value = parse_read_answer(&[0x80, CMD_ANSWER, 0x01, 0x20, 0x7D, 0x00], location)
            .expect("answer should parse");
        assert_eq!(value, Some(ParamValue::Integer(32_000)));
    }

    #[test]
    fn status_answer_to_read_is_no_value() {
        let location = locate(PARAM_MEASURE).expect("measure is mapped");
        let value = parse_read_answer(&[0x80, CMD_STATUS, 0x05, 0x00], location)
            .expect("status answer is valid");
        assert_eq!(value, None);
    }

    #[test]
    fn rejects_answer_for_other_parameter() {
        let location = locate(PARAM_VALVE_OUTPUT).expect("valve is mapped");
        let err = parse_read_answer(&[0x80, CMD_ANSWER, 0x01, 0x20, 0x00, 0x00], location)
            .expect_err("wrong parameter");
        assert!(err.to_string().contains("expected 114"));
    }

    #[test]
    fn decodes_capacity_float_and_unit_text() {
        let location = locate(PARAM_CAPACITY).expect("capacity is mapped");
        let mut answer = vec![0x80, CMD_ANSWER, 0x01, 0x4D];
        answer.extend_from_slice(&10.0f32.to_be_bytes());
        let value = parse_read_answer(&answer, location).expect("capacity should parse");
        assert_eq!(value, Some(ParamValue::Float(10.0)));

        let text = decode_value(ParamKind::Text, &[0x00, b'b', b'a', b'r', 0x00, 0x20]);
        assert_eq!(text.ok(), Some(ParamValue::Text("bar".into())));
        let sized = decode_value(ParamKind::Text, &[0x02, b'm', b'b', b'a']);
        assert_eq!(sized.ok(), Some(ParamValue::Text("mb".into())));
    }

    #[test]
    fn invalid_utf8_text_falls_back_to_bytes() {
        let value = decode_value(ParamKind::Text, &[0x02, 0xFF, 0x41]).expect("text decodes");
        assert_eq!(value, ParamValue::Bytes(vec![0xFF, 0x41]));
    }

    #[test]
    fn write_status_maps_codes() {
        parse_write_status(&[0x80, CMD_STATUS, 0x00, 0x00]).expect("status 0 is ok");
        let err = parse_write_status(&[0x80, CMD_STATUS, 0x03, 0x04]).expect_err("status 3");
        assert!(matches!(err, TransportError::Status { status: 3 }));
    }
}
