//! JSON OSD: conventional JSON with two extensions - binary values become base64
//!  strings, UUIDs and dates become their canonical string forms.
//!
//! On parse, strings in canonical UUID or ISO-8601 form are promoted back to their
//!  typed variants; raw binary is indistinguishable from an ordinary string and
//!  stays a string.

use serde_json::{Map, Number, Value};
use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::osd::{base64_encode, format_date, parse_date, Osd};

pub fn emit(value: &Osd) -> Vec<u8> {
    serde_json::to_vec(&to_json(value)).expect("a JSON value always serializes")
}

pub fn parse(data: &[u8]) -> Result<Osd> {
    let value: Value = serde_json::from_slice(data)
        .map_err(|e| GridError::Malformed(format!("JSON OSD parse error: {}", e)))?;
    Ok(from_json(value))
}

fn to_json(value: &Osd) -> Value {
    match value {
        Osd::Null => Value::Null,
        Osd::Boolean(b) => Value::Bool(*b),
        Osd::Integer(i) => Value::Number((*i).into()),
        Osd::Real(r) => Number::from_f64(*r).map(Value::Number).unwrap_or(Value::Null),
        Osd::String(s) => Value::String(s.clone()),
        Osd::Uuid(u) => Value::String(u.hyphenated().to_string()),
        Osd::Date(d) => Value::String(format_date(d)),
        Osd::Uri(s) => Value::String(s.clone()),
        Osd::Binary(b) => Value::String(base64_encode(b)),
        Osd::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        Osd::Map(entries) => {
            let mut obj = Map::with_capacity(entries.len());
            for (key, item) in entries {
                obj.insert(key.clone(), to_json(item));
            }
            Value::Object(obj)
        }
    }
}

fn from_json(value: Value) -> Osd {
    match value {
        Value::Null => Osd::Null,
        Value::Bool(b) => Osd::Boolean(b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if let Ok(small) = i32::try_from(i) {
                    return Osd::Integer(small);
                }
            }
            Osd::Real(n.as_f64().unwrap_or(0.0))
        }
        Value::String(s) => promote_string(s),
        Value::Array(items) => Osd::Array(items.into_iter().map(from_json).collect()),
        Value::Object(obj) => {
            let mut entries = rustc_hash::FxHashMap::default();
            for (key, item) in obj {
                entries.insert(key, from_json(item));
            }
            Osd::Map(entries)
        }
    }
}

fn promote_string(s: String) -> Osd {
    if s.len() == 36 {
        if let Ok(id) = Uuid::parse_str(&s) {
            return Osd::Uuid(id);
        }
    }
    if s.len() >= 20 && s.ends_with('Z') {
        if let Some(date) = parse_date(&s) {
            return Osd::Date(date);
        }
    }
    Osd::String(s)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashMap;

    use super::*;

    #[rstest]
    #[case::null(Osd::Null)]
    #[case::boolean(Osd::Boolean(true))]
    #[case::integer(Osd::Integer(-17))]
    #[case::real(Osd::Real(2.5))]
    #[case::string(Osd::from("some text"))]
    #[case::uuid(Osd::Uuid(Uuid::parse_str("97f4aeca-88a1-42a1-b385-b97b18abb255").unwrap()))]
    #[case::date(Osd::Date(parse_date("2019-06-30T09:00:00Z").unwrap()))]
    #[case::array(Osd::Array(vec![Osd::Integer(1), Osd::Boolean(true), Osd::Null]))]
    fn test_roundtrip(#[case] value: Osd) {
        let encoded = emit(&value);
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn test_spec_example() {
        let parsed = parse(br#"{"a":[1,true,null]}"#).unwrap();

        let mut expected_map = FxHashMap::default();
        expected_map.insert(
            "a".to_string(),
            Osd::Array(vec![Osd::Integer(1), Osd::Boolean(true), Osd::Null]),
        );
        assert_eq!(parsed, Osd::Map(expected_map));

        let reemitted = emit(&parsed);
        assert_eq!(parse(&reemitted).unwrap(), parsed);
    }

    #[test]
    fn test_binary_becomes_base64_string() {
        let encoded = emit(&Osd::Binary(vec![1, 2, 3]));
        assert_eq!(encoded, br#""AQID""#);
        // parse-back yields a string - raw binary is not sniffable
        assert_eq!(parse(&encoded).unwrap(), Osd::from("AQID"));
    }

    #[test]
    fn test_large_integer_becomes_real() {
        let parsed = parse(b"4294967296").unwrap();
        assert_eq!(parsed, Osd::Real(4294967296.0));
    }

    #[test]
    fn test_plain_string_is_not_promoted() {
        assert_eq!(parse(br#""hello""#).unwrap(), Osd::from("hello"));
    }

    #[test]
    fn test_malformed() {
        assert!(parse(b"{unquoted: 1}").is_err());
    }
}
