use crate::error::TransportError;

const FRAME_START: u8 = b':';
const FRAME_END: &[u8] = b"\r\n";

/// Wraps a binary message body in an ASCII propar frame.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = u8::try_from(body.len())
        .map_err(|_| TransportError::Frame(format!("body too long: {} bytes", body.len())))?;
    let mut out = Vec::with_capacity(body.len() * 2 + 5);
    out.push(FRAME_START);
    push_hex(&mut out, len);
    for byte in body {
        push_hex(&mut out, *byte);
    }
    out.extend_from_slice(FRAME_END);
    Ok(out)
}

/// Extracts the message body from an ASCII frame, checking the length prefix.
pub fn decode_frame(frame: &[u8]) -> Result<Vec<u8>, TransportError> {
    let trimmed = frame
        .strip_suffix(FRAME_END)
        .or_else(|| frame.strip_suffix(b"\n"))
        .unwrap_or(frame);
    let Some(hex) = trimmed.strip_prefix(&[FRAME_START]) else {
        return Err(TransportError::Frame("missing ':' start marker".to_string()));
    };
    if hex.len() < 2 || hex.len() % 2 != 0 {
        return Err(TransportError::Frame(format!(
            "odd or short hex payload: {} chars",
            hex.len()
        )));
    }

    let mut bytes = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        bytes.push(parse_hex_pair(pair)?);
    }

    let declared = usize::from(bytes[0]);
    let body = bytes.split_off(1);
    if body.len() != declared {
        return Err(TransportError::Frame(format!(
            "length mismatch: declared {declared}, got {}",
            body.len()
        )));
    }
    Ok(body)
}

fn push_hex(out: &mut Vec<u8>, byte: u8) {
    const DIGITS: &[u8; 16] = b"0123456789ABCDEF";
    out.push(DIGITS[usize::from(byte >> 4)]);
    out.push(DIGITS[usize::from(byte & 0x0F)]);
}

fn parse_hex_pair(pair: &[u8]) -> Result<u8, TransportError> {
    let text = std::str::from_utf8(pair)
        .map_err(|_| TransportError::Frame("non-ascii hex digit".to_string()))?;
    u8::from_str_radix(text, 16)
        .map_err(|_| TransportError::Frame(format!("invalid hex byte {text:?}")))
}
