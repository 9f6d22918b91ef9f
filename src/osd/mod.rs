//! OSD: the self-describing structured-data value model shared by capability
//!  traffic, login and event-queue messages.
//!
//! Values form a tagged tree. All scalar conversions are total: a value that has no
//!  sensible rendering in the target type coerces to that type's neutral element
//!  (false, 0, empty string, the nil UUID, the epoch, an empty byte sequence).
//!
//! Four interchangeable serializations are supported; [`parse`] selects one by
//!  sniffing the first bytes of the document.

pub mod binary;
pub mod json;
pub mod notation;
pub mod xml;

use chrono::{DateTime, SecondsFormat, Utc};
use rustc_hash::FxHashMap;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Osd {
    #[default]
    Null,
    Boolean(bool),
    Integer(i32),
    Real(f64),
    String(String),
    Uuid(Uuid),
    Date(DateTime<Utc>),
    Uri(String),
    Binary(Vec<u8>),
    Map(FxHashMap<String, Osd>),
    Array(Vec<Osd>),
}

impl Osd {
    pub fn epoch() -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH
    }

    pub fn as_boolean(&self) -> bool {
        match self {
            Osd::Boolean(b) => *b,
            Osd::Integer(i) => *i != 0,
            Osd::Real(r) => *r != 0.0,
            Osd::String(s) => !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false")),
            Osd::Uuid(u) => !u.is_nil(),
            Osd::Binary(b) => b.iter().any(|&x| x != 0),
            Osd::Array(a) => !a.is_empty(),
            _ => false,
        }
    }

    pub fn as_integer(&self) -> i32 {
        match self {
            Osd::Boolean(b) => *b as i32,
            Osd::Integer(i) => *i,
            Osd::Real(r) => clamp_to_i32(*r),
            Osd::String(s) => clamp_to_i32(parse_leading_number(s).floor()),
            Osd::Date(d) => clamp_to_i32(d.timestamp() as f64),
            Osd::Binary(b) => be_prefix(b, 4) as i32,
            Osd::Array(a) => array_be_prefix(a, 4) as i32,
            _ => 0,
        }
    }

    pub fn as_long(&self) -> i64 {
        match self {
            Osd::Boolean(b) => *b as i64,
            Osd::Integer(i) => *i as i64,
            Osd::Real(r) => clamp_to_i64(*r),
            Osd::String(s) => clamp_to_i64(parse_leading_number(s).floor()),
            Osd::Date(d) => d.timestamp(),
            Osd::Binary(b) => be_prefix(b, 8) as i64,
            Osd::Array(a) => array_be_prefix(a, 8) as i64,
            _ => 0,
        }
    }

    pub fn as_real(&self) -> f64 {
        match self {
            Osd::Boolean(b) => *b as i32 as f64,
            Osd::Integer(i) => *i as f64,
            Osd::Real(r) => *r,
            Osd::String(s) => parse_leading_number(s),
            Osd::Date(d) => d.timestamp() as f64 + d.timestamp_subsec_millis() as f64 / 1000.0,
            _ => 0.0,
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Osd::Null => String::new(),
            Osd::Boolean(b) => if *b { "1" } else { "0" }.to_string(),
            Osd::Integer(i) => i.to_string(),
            Osd::Real(r) => format!("{:?}", r),
            Osd::String(s) | Osd::Uri(s) => s.clone(),
            Osd::Uuid(u) => u.hyphenated().to_string(),
            Osd::Date(d) => format_date(d),
            Osd::Binary(b) => base64_encode(b),
            Osd::Map(_) | Osd::Array(_) => String::new(),
        }
    }

    pub fn as_uuid(&self) -> Uuid {
        match self {
            Osd::Uuid(u) => *u,
            Osd::String(s) => Uuid::parse_str(s).unwrap_or(Uuid::nil()),
            _ => Uuid::nil(),
        }
    }

    pub fn as_date(&self) -> DateTime<Utc> {
        match self {
            Osd::Date(d) => *d,
            Osd::String(s) => parse_date(s).unwrap_or(Self::epoch()),
            _ => Self::epoch(),
        }
    }

    pub fn as_uri(&self) -> String {
        match self {
            Osd::Uri(s) | Osd::String(s) => s.clone(),
            _ => String::new(),
        }
    }

    pub fn as_binary(&self) -> Vec<u8> {
        match self {
            Osd::Boolean(b) => vec![*b as u8],
            Osd::Integer(i) => i.to_be_bytes().to_vec(),
            Osd::Real(r) => r.to_be_bytes().to_vec(),
            Osd::String(s) | Osd::Uri(s) => s.as_bytes().to_vec(),
            Osd::Uuid(u) => u.as_bytes().to_vec(),
            Osd::Binary(b) => b.clone(),
            _ => Vec::new(),
        }
    }

    /// convenience lookup for map values; returns `Null` for non-maps / missing keys
    pub fn get(&self, key: &str) -> &Osd {
        const NULL: &Osd = &Osd::Null;
        match self {
            Osd::Map(m) => m.get(key).unwrap_or(NULL),
            _ => NULL,
        }
    }
}

impl From<bool> for Osd {
    fn from(value: bool) -> Self {
        Osd::Boolean(value)
    }
}
impl From<i32> for Osd {
    fn from(value: i32) -> Self {
        Osd::Integer(value)
    }
}
impl From<f64> for Osd {
    fn from(value: f64) -> Self {
        Osd::Real(value)
    }
}
impl From<&str> for Osd {
    fn from(value: &str) -> Self {
        Osd::String(value.to_string())
    }
}
impl From<String> for Osd {
    fn from(value: String) -> Self {
        Osd::String(value)
    }
}
impl From<Uuid> for Osd {
    fn from(value: Uuid) -> Self {
        Osd::Uuid(value)
    }
}
impl From<DateTime<Utc>> for Osd {
    fn from(value: DateTime<Utc>) -> Self {
        Osd::Date(value)
    }
}
impl From<Vec<u8>> for Osd {
    fn from(value: Vec<u8>) -> Self {
        Osd::Binary(value)
    }
}
impl From<Vec<Osd>> for Osd {
    fn from(value: Vec<Osd>) -> Self {
        Osd::Array(value)
    }
}
impl From<FxHashMap<String, Osd>> for Osd {
    fn from(value: FxHashMap<String, Osd>) -> Self {
        Osd::Map(value)
    }
}

/// Parse an OSD document, selecting the serialization by its leading bytes:
///  `<llsd>` / `<?xml` is XML-LLSD, `<? llsd/notation` is notation,
///  `<? llsd/binary` is binary, anything else is treated as JSON.
pub fn parse(data: &[u8]) -> Result<Osd> {
    let head: String = data
        .iter()
        .skip_while(|b| b.is_ascii_whitespace())
        .take(18)
        .map(|&b| b.to_ascii_lowercase() as char)
        .collect();

    if head.starts_with("<llsd") || head.starts_with("<?xml") {
        xml::parse(data)
    } else if head.starts_with("<? llsd/notation") || head.starts_with("<?llsd/notation") {
        notation::parse(data)
    } else if head.starts_with("<? llsd/binary") || head.starts_with("<?llsd/binary") {
        binary::parse(data)
    } else {
        json::parse(data)
    }
}

fn clamp_to_i32(value: f64) -> i32 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(i32::MIN as f64, i32::MAX as f64) as i32
}

fn clamp_to_i64(value: f64) -> i64 {
    if value.is_nan() {
        return 0;
    }
    value.clamp(i64::MIN as f64, i64::MAX as f64) as i64
}

/// decimal parse of the longest numeric prefix; 0 if there is none
fn parse_leading_number(s: &str) -> f64 {
    let s = s.trim_start();
    let mut end = 0;
    let mut seen_dot = false;
    for (i, c) in s.char_indices() {
        match c {
            '+' | '-' if i == 0 => {}
            '.' if !seen_dot => seen_dot = true,
            '0'..='9' => {}
            _ => break,
        }
        end = i + c.len_utf8();
    }
    s[..end].parse::<f64>().unwrap_or(0.0)
}

/// first `n` bytes interpreted as a big-endian unsigned value, 0 if fewer are present
fn be_prefix(bytes: &[u8], n: usize) -> u64 {
    if bytes.len() < n {
        return 0;
    }
    bytes[..n].iter().fold(0u64, |acc, &b| acc << 8 | b as u64)
}

fn array_be_prefix(elements: &[Osd], n: usize) -> u64 {
    if elements.len() < n {
        return 0;
    }
    elements[..n]
        .iter()
        .fold(0u64, |acc, e| acc << 8 | (e.as_integer() as u8) as u64)
}

pub(crate) fn format_date(date: &DateTime<Utc>) -> String {
    if date.timestamp_subsec_millis() == 0 {
        date.format("%Y-%m-%dT%H:%M:%SZ").to_string()
    } else {
        date.to_rfc3339_opts(SecondsFormat::Millis, true)
    }
}

pub(crate) fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn base64_encode(data: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    STANDARD.encode(data)
}

pub(crate) fn base64_decode(s: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    let compact: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD.decode(compact).ok()
}
