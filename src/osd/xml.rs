//! XML-LLSD: the interoperability baseline serialization with an `<llsd>` root
//!  element. The parser covers exactly the LLSD element set - it is not a general
//!  XML parser.

use crate::error::{GridError, Result};
use crate::osd::{base64_decode, base64_encode, format_date, parse_date, Osd};

pub fn emit(value: &Osd) -> Vec<u8> {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
    out.push_str("<llsd>");
    emit_value(value, &mut out);
    out.push_str("</llsd>");
    out.into_bytes()
}

pub fn parse(data: &[u8]) -> Result<Osd> {
    let text = std::str::from_utf8(data)
        .map_err(|_| GridError::malformed("XML OSD document is not UTF-8"))?;
    let mut cursor = Cursor::new(text);

    let root = cursor.next_tag()?;
    match root.name.as_str() {
        "llsd" => {}
        // the conventional empty-response sentinel
        "Empty" => return Ok(Osd::Null),
        other => {
            return Err(GridError::Malformed(format!(
                "unexpected XML OSD root element <{}>",
                other
            )))
        }
    }
    if root.self_closing {
        return Ok(Osd::Null);
    }

    let peeked = cursor.peek_tag()?;
    if peeked.closing && peeked.name == "llsd" {
        cursor.next_tag()?;
        return Ok(Osd::Null);
    }

    let value = parse_element(&mut cursor)?;
    cursor.expect_close("llsd")?;
    Ok(value)
}

fn emit_value(value: &Osd, out: &mut String) {
    match value {
        Osd::Null => out.push_str("<undef/>"),
        Osd::Boolean(b) => {
            out.push_str("<boolean>");
            out.push_str(if *b { "true" } else { "false" });
            out.push_str("</boolean>");
        }
        Osd::Integer(i) => {
            out.push_str("<integer>");
            out.push_str(&i.to_string());
            out.push_str("</integer>");
        }
        Osd::Real(r) => {
            out.push_str("<real>");
            out.push_str(&format!("{:?}", r));
            out.push_str("</real>");
        }
        Osd::String(s) => {
            out.push_str("<string>");
            out.push_str(&escape(s));
            out.push_str("</string>");
        }
        Osd::Uuid(u) => {
            out.push_str("<uuid>");
            out.push_str(&u.hyphenated().to_string());
            out.push_str("</uuid>");
        }
        Osd::Date(d) => {
            out.push_str("<date>");
            out.push_str(&format_date(d));
            out.push_str("</date>");
        }
        Osd::Uri(s) => {
            out.push_str("<uri>");
            out.push_str(&escape(s));
            out.push_str("</uri>");
        }
        Osd::Binary(b) => {
            out.push_str("<binary>");
            out.push_str(&base64_encode(b));
            out.push_str("</binary>");
        }
        Osd::Array(items) => {
            out.push_str("<array>");
            for item in items {
                emit_value(item, out);
            }
            out.push_str("</array>");
        }
        Osd::Map(entries) => {
            out.push_str("<map>");
            for (key, item) in entries {
                out.push_str("<key>");
                out.push_str(&escape(key));
                out.push_str("</key>");
                emit_value(item, out);
            }
            out.push_str("</map>");
        }
    }
}

fn parse_element(cursor: &mut Cursor) -> Result<Osd> {
    let tag = cursor.next_tag()?;
    if tag.closing {
        return Err(GridError::Malformed(format!(
            "unexpected closing element </{}>",
            tag.name
        )));
    }

    match tag.name.as_str() {
        "undef" => {
            if !tag.self_closing {
                cursor.expect_close("undef")?;
            }
            Ok(Osd::Null)
        }
        "boolean" => {
            let text = cursor.leaf_text(&tag)?;
            Ok(Osd::Boolean(text.trim() == "true" || text.trim() == "1"))
        }
        "integer" => {
            let text = cursor.leaf_text(&tag)?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(Osd::Integer(0));
            }
            trimmed
                .parse::<i32>()
                .map(Osd::Integer)
                .map_err(|_| GridError::Malformed(format!("bad XML OSD integer {:?}", trimmed)))
        }
        "real" => {
            let text = cursor.leaf_text(&tag)?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(Osd::Real(0.0));
            }
            trimmed
                .parse::<f64>()
                .map(Osd::Real)
                .map_err(|_| GridError::Malformed(format!("bad XML OSD real {:?}", trimmed)))
        }
        "string" => Ok(Osd::String(cursor.leaf_text(&tag)?)),
        "uuid" => {
            let text = cursor.leaf_text(&tag)?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(Osd::Uuid(uuid::Uuid::nil()));
            }
            uuid::Uuid::parse_str(trimmed)
                .map(Osd::Uuid)
                .map_err(|_| GridError::Malformed(format!("bad XML OSD uuid {:?}", trimmed)))
        }
        "date" => {
            let text = cursor.leaf_text(&tag)?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Ok(Osd::Date(Osd::epoch()));
            }
            parse_date(trimmed)
                .map(Osd::Date)
                .ok_or_else(|| GridError::Malformed(format!("bad XML OSD date {:?}", trimmed)))
        }
        "uri" => Ok(Osd::Uri(cursor.leaf_text(&tag)?)),
        "binary" => {
            let text = cursor.leaf_text(&tag)?;
            base64_decode(&text)
                .map(Osd::Binary)
                .ok_or_else(|| GridError::malformed("bad XML OSD base64 binary"))
        }
        "array" => {
            let mut items = Vec::new();
            if tag.self_closing {
                return Ok(Osd::Array(items));
            }
            loop {
                let peeked = cursor.peek_tag()?;
                if peeked.closing {
                    cursor.expect_close("array")?;
                    return Ok(Osd::Array(items));
                }
                items.push(parse_element(cursor)?);
            }
        }
        "map" => {
            let mut entries = rustc_hash::FxHashMap::default();
            if tag.self_closing {
                return Ok(Osd::Map(entries));
            }
            loop {
                let peeked = cursor.peek_tag()?;
                if peeked.closing {
                    cursor.expect_close("map")?;
                    return Ok(Osd::Map(entries));
                }
                let key_tag = cursor.next_tag()?;
                if key_tag.name != "key" || key_tag.closing {
                    return Err(GridError::malformed("XML OSD map entry without <key>"));
                }
                let key = cursor.leaf_text(&key_tag)?;
                entries.insert(key, parse_element(cursor)?);
            }
        }
        other => Err(GridError::Malformed(format!(
            "unknown XML OSD element <{}>",
            other
        ))),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let end = rest
            .find(';')
            .ok_or_else(|| GridError::malformed("unterminated XML entity"))?;
        match &rest[..end + 1] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            other => {
                return Err(GridError::Malformed(format!(
                    "unsupported XML entity {:?}",
                    other
                )))
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

#[derive(Debug, Clone)]
struct Tag {
    name: String,
    closing: bool,
    self_closing: bool,
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Cursor<'a> {
        Cursor { rest: text }
    }

    /// advance to and consume the next tag, skipping prologs and inter-element text
    fn next_tag(&mut self) -> Result<Tag> {
        loop {
            let open = self
                .rest
                .find('<')
                .ok_or_else(|| GridError::malformed("XML OSD document ends unexpectedly"))?;
            let close = self.rest[open..]
                .find('>')
                .ok_or_else(|| GridError::malformed("unterminated XML tag"))?
                + open;

            let raw = &self.rest[open + 1..close];
            self.rest = &self.rest[close + 1..];

            // skip the <?xml ...?> prolog and comments
            if raw.starts_with('?') || raw.starts_with('!') {
                continue;
            }

            let closing = raw.starts_with('/');
            let self_closing = raw.ends_with('/');
            let name = raw
                .trim_start_matches('/')
                .trim_end_matches('/')
                .split_whitespace()
                .next()
                .unwrap_or("")
                .to_string();
            if name.is_empty() {
                return Err(GridError::malformed("empty XML tag"));
            }

            return Ok(Tag {
                name,
                closing,
                self_closing,
            });
        }
    }

    fn peek_tag(&self) -> Result<Tag> {
        Cursor { rest: self.rest }.next_tag()
    }

    fn expect_close(&mut self, name: &str) -> Result<()> {
        let tag = self.next_tag()?;
        if !tag.closing || tag.name != name {
            return Err(GridError::Malformed(format!(
                "expected </{}>, found <{}{}>",
                name,
                if tag.closing { "/" } else { "" },
                tag.name
            )));
        }
        Ok(())
    }

    /// text content of a leaf element, consuming its closing tag
    fn leaf_text(&mut self, tag: &Tag) -> Result<String> {
        if tag.self_closing {
            return Ok(String::new());
        }
        let end = self
            .rest
            .find('<')
            .ok_or_else(|| GridError::malformed("XML OSD document ends inside an element"))?;
        let text = unescape(&self.rest[..end])?;
        self.rest = &self.rest[end..];
        self.expect_close(&tag.name)?;
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashMap;
    use uuid::Uuid;

    use super::*;

    #[rstest]
    #[case::null(Osd::Null)]
    #[case::true_(Osd::Boolean(true))]
    #[case::false_(Osd::Boolean(false))]
    #[case::integer(Osd::Integer(123))]
    #[case::real(Osd::Real(-0.25))]
    #[case::string(Osd::from("hello world"))]
    #[case::string_markup(Osd::from("a <b> & 'c' \"d\""))]
    #[case::string_empty(Osd::from(""))]
    #[case::uuid(Osd::Uuid(Uuid::parse_str("11111111-2222-3333-4444-555555555555").unwrap()))]
    #[case::date(Osd::Date(parse_date("2010-10-26T21:32:52Z").unwrap()))]
    #[case::uri(Osd::Uri("https://example.com/?q=1&r=2".to_string()))]
    #[case::binary(Osd::Binary(vec![0, 255, 128]))]
    #[case::array(Osd::Array(vec![Osd::Integer(1), Osd::Null, Osd::from("s")]))]
    #[case::empty_array(Osd::Array(vec![]))]
    fn test_roundtrip(#[case] value: Osd) {
        let encoded = emit(&value);
        assert_eq!(parse(&encoded).unwrap(), value, "document: {}", String::from_utf8_lossy(&encoded));
    }

    #[test]
    fn test_map_roundtrip() {
        let mut m = FxHashMap::default();
        m.insert("name".to_string(), Osd::from("Ruth"));
        m.insert("attachments".to_string(), Osd::Array(vec![Osd::Integer(2)]));
        let value = Osd::Map(m);
        assert_eq!(parse(&emit(&value)).unwrap(), value);
    }

    #[rstest]
    #[case::empty_llsd("<llsd></llsd>", Osd::Null)]
    #[case::empty_sentinel("<?xml version=\"1.0\"?><Empty></Empty>", Osd::Null)]
    #[case::whitespace_between("<llsd>\n  <integer> 7 </integer>\n</llsd>", Osd::Integer(7))]
    #[case::self_closed_string("<llsd><string/></llsd>", Osd::from(""))]
    #[case::self_closed_undef("<llsd><undef/></llsd>", Osd::Null)]
    #[case::boolean_numeric("<llsd><boolean>1</boolean></llsd>", Osd::Boolean(true))]
    fn test_parse_forms(#[case] text: &str, #[case] expected: Osd) {
        assert_eq!(parse(text.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case::wrong_root("<root><integer>1</integer></root>")]
    #[case::unknown_element("<llsd><widget>1</widget></llsd>")]
    #[case::mismatched_close("<llsd><integer>1</real></llsd>")]
    #[case::truncated("<llsd><integer>1")]
    #[case::bad_entity("<llsd><string>&bogus;</string></llsd>")]
    fn test_parse_malformed(#[case] text: &str) {
        assert!(parse(text.as_bytes()).is_err());
    }
}
