//! Binary OSD: length-framed, big-endian, one-byte type tags.

use bytes::{Buf, BufMut};
use chrono::DateTime;

use crate::error::{GridError, Result};
use crate::osd::Osd;

const HEADER: &[u8] = b"<? llsd/binary ?>\n";

pub fn emit(value: &Osd) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.put_slice(HEADER);
    encode_value(value, &mut buf);
    buf
}

pub fn parse(data: &[u8]) -> Result<Osd> {
    let mut buf = skip_header(data);
    let value = decode_value(&mut buf)?;
    Ok(value)
}

fn skip_header(data: &[u8]) -> &[u8] {
    if data.starts_with(b"<?") {
        match data.iter().position(|&b| b == b'\n') {
            Some(pos) => &data[pos + 1..],
            None => data,
        }
    } else {
        data
    }
}

fn encode_value(value: &Osd, buf: &mut Vec<u8>) {
    match value {
        Osd::Null => buf.put_u8(b'!'),
        Osd::Boolean(true) => buf.put_u8(b'1'),
        Osd::Boolean(false) => buf.put_u8(b'0'),
        Osd::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_i32(*i);
        }
        Osd::Real(r) => {
            buf.put_u8(b'r');
            buf.put_f64(*r);
        }
        Osd::String(s) => {
            buf.put_u8(b's');
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Osd::Uuid(u) => {
            buf.put_u8(b'u');
            buf.put_slice(u.as_bytes());
        }
        Osd::Date(d) => {
            buf.put_u8(b'd');
            let seconds = d.timestamp() as f64 + d.timestamp_subsec_millis() as f64 / 1000.0;
            buf.put_f64(seconds);
        }
        Osd::Uri(s) => {
            buf.put_u8(b'l');
            buf.put_u32(s.len() as u32);
            buf.put_slice(s.as_bytes());
        }
        Osd::Binary(b) => {
            buf.put_u8(b'b');
            buf.put_u32(b.len() as u32);
            buf.put_slice(b);
        }
        Osd::Array(items) => {
            buf.put_u8(b'[');
            buf.put_u32(items.len() as u32);
            for item in items {
                encode_value(item, buf);
            }
            buf.put_u8(b']');
        }
        Osd::Map(entries) => {
            buf.put_u8(b'{');
            buf.put_u32(entries.len() as u32);
            for (key, item) in entries {
                buf.put_u8(b'k');
                buf.put_u32(key.len() as u32);
                buf.put_slice(key.as_bytes());
                encode_value(item, buf);
            }
            buf.put_u8(b'}');
        }
    }
}

fn decode_value(buf: &mut &[u8]) -> Result<Osd> {
    let tag = buf.try_get_u8()?;
    match tag {
        b'!' => Ok(Osd::Null),
        b'1' => Ok(Osd::Boolean(true)),
        b'0' => Ok(Osd::Boolean(false)),
        b'i' => Ok(Osd::Integer(buf.try_get_i32()?)),
        b'r' => Ok(Osd::Real(buf.try_get_f64()?)),
        b's' => Ok(Osd::String(decode_string(buf)?)),
        b'u' => {
            if buf.remaining() < 16 {
                return Err(GridError::malformed("truncated binary OSD UUID"));
            }
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Ok(Osd::Uuid(uuid::Uuid::from_bytes(raw)))
        }
        b'd' => {
            let seconds = buf.try_get_f64()?;
            let millis = (seconds * 1000.0) as i64;
            let date = DateTime::from_timestamp_millis(millis)
                .ok_or_else(|| GridError::malformed("binary OSD date out of range"))?;
            Ok(Osd::Date(date))
        }
        b'l' => Ok(Osd::Uri(decode_string(buf)?)),
        b'b' => {
            let len = buf.try_get_u32()? as usize;
            if buf.remaining() < len {
                return Err(GridError::malformed("truncated binary OSD byte field"));
            }
            let mut raw = vec![0u8; len];
            buf.copy_to_slice(&mut raw);
            Ok(Osd::Binary(raw))
        }
        b'[' => {
            let count = buf.try_get_u32()? as usize;
            let mut items = Vec::with_capacity(count.min(4096));
            for _ in 0..count {
                items.push(decode_value(buf)?);
            }
            expect_tag(buf, b']')?;
            Ok(Osd::Array(items))
        }
        b'{' => {
            let count = buf.try_get_u32()? as usize;
            let mut entries = rustc_hash::FxHashMap::default();
            for _ in 0..count {
                expect_tag(buf, b'k')?;
                let key = decode_string(buf)?;
                entries.insert(key, decode_value(buf)?);
            }
            expect_tag(buf, b'}')?;
            Ok(Osd::Map(entries))
        }
        other => Err(GridError::Malformed(format!(
            "unknown binary OSD tag 0x{:02x}",
            other
        ))),
    }
}

fn decode_string(buf: &mut &[u8]) -> Result<String> {
    let len = buf.try_get_u32()? as usize;
    if buf.remaining() < len {
        return Err(GridError::malformed("truncated binary OSD string"));
    }
    let mut raw = vec![0u8; len];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| GridError::malformed("binary OSD string is not UTF-8"))
}

fn expect_tag(buf: &mut &[u8], expected: u8) -> Result<()> {
    let actual = buf.try_get_u8()?;
    if actual != expected {
        return Err(GridError::Malformed(format!(
            "expected binary OSD tag {:?}, found 0x{:02x}",
            expected as char, actual
        )));
    }
    Ok(())
}
