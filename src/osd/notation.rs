//! Notation OSD: the compact textual serialization using one-letter sigils
//!  (`i`, `r`, `s`, `u`, `d`, `l`, `b64`, `[...]`, `{...}`).

use uuid::Uuid;

use crate::error::{GridError, Result};
use crate::osd::{base64_decode, base64_encode, format_date, parse_date, Osd};

const HEADER: &str = "<? llsd/notation ?>\n";

pub fn emit(value: &Osd) -> Vec<u8> {
    let mut out = String::from(HEADER);
    emit_value(value, &mut out);
    out.into_bytes()
}

pub fn parse(data: &[u8]) -> Result<Osd> {
    let text = std::str::from_utf8(data)
        .map_err(|_| GridError::malformed("notation OSD is not UTF-8"))?;
    let mut cursor = Cursor::new(skip_header(text));
    let value = cursor.parse_value()?;
    Ok(value)
}

fn skip_header(text: &str) -> &str {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix("<?") {
        if let Some(pos) = rest.find("?>") {
            return &rest[pos + 2..];
        }
    }
    text
}

fn emit_value(value: &Osd, out: &mut String) {
    match value {
        Osd::Null => out.push('!'),
        Osd::Boolean(true) => out.push('1'),
        Osd::Boolean(false) => out.push('0'),
        Osd::Integer(i) => {
            out.push('i');
            out.push_str(&i.to_string());
        }
        Osd::Real(r) => {
            out.push('r');
            out.push_str(&format!("{:?}", r));
        }
        Osd::String(s) => {
            out.push('s');
            emit_quoted(s, out);
        }
        Osd::Uuid(u) => {
            out.push('u');
            out.push_str(&u.hyphenated().to_string());
        }
        Osd::Date(d) => {
            out.push('d');
            out.push('"');
            out.push_str(&format_date(d));
            out.push('"');
        }
        Osd::Uri(s) => {
            out.push('l');
            out.push('"');
            out.push_str(&s.replace('\\', "\\\\").replace('"', "\\\""));
            out.push('"');
        }
        Osd::Binary(b) => {
            out.push_str("b64\"");
            out.push_str(&base64_encode(b));
            out.push('"');
        }
        Osd::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        }
        Osd::Map(entries) => {
            out.push('{');
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_quoted(key, out);
                out.push(':');
                emit_value(item, out);
            }
            out.push('}');
        }
    }
}

fn emit_quoted(s: &str, out: &mut String) {
    out.push('\'');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            other => out.push(other),
        }
    }
    out.push('\'');
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Cursor<'a> {
        Cursor { rest: text }
    }

    fn skip_whitespace(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    fn bump(&mut self) -> Result<char> {
        let c = self
            .peek()
            .ok_or_else(|| GridError::malformed("notation OSD ends unexpectedly"))?;
        self.rest = &self.rest[c.len_utf8()..];
        Ok(c)
    }

    fn eat(&mut self, expected: char) -> Result<()> {
        let c = self.bump()?;
        if c != expected {
            return Err(GridError::Malformed(format!(
                "notation OSD: expected {:?}, found {:?}",
                expected, c
            )));
        }
        Ok(())
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(rest) = self.rest.strip_prefix(keyword) {
            self.rest = rest;
            true
        } else {
            false
        }
    }

    fn parse_value(&mut self) -> Result<Osd> {
        self.skip_whitespace();
        let c = self
            .peek()
            .ok_or_else(|| GridError::malformed("empty notation OSD document"))?;

        match c {
            '!' => {
                self.bump()?;
                Ok(Osd::Null)
            }
            '1' => {
                self.bump()?;
                Ok(Osd::Boolean(true))
            }
            '0' => {
                self.bump()?;
                Ok(Osd::Boolean(false))
            }
            't' | 'T' => {
                if self.eat_keyword("true") || self.eat_keyword("TRUE") {
                    Ok(Osd::Boolean(true))
                } else {
                    Err(GridError::malformed("notation OSD: stray 't'"))
                }
            }
            'f' | 'F' => {
                if self.eat_keyword("false") || self.eat_keyword("FALSE") {
                    Ok(Osd::Boolean(false))
                } else {
                    Err(GridError::malformed("notation OSD: stray 'f'"))
                }
            }
            'i' => {
                self.bump()?;
                let token = self.take_number_token();
                token
                    .parse::<i32>()
                    .map(Osd::Integer)
                    .map_err(|_| GridError::Malformed(format!("bad notation integer {:?}", token)))
            }
            'r' => {
                self.bump()?;
                let token = self.take_number_token();
                token
                    .parse::<f64>()
                    .map(Osd::Real)
                    .map_err(|_| GridError::Malformed(format!("bad notation real {:?}", token)))
            }
            's' => {
                self.bump()?;
                Ok(Osd::String(self.parse_quoted()?))
            }
            '\'' | '"' => Ok(Osd::String(self.parse_quoted()?)),
            'u' => {
                self.bump()?;
                let (token, rest) = split_uuid_token(self.rest)?;
                self.rest = rest;
                Uuid::parse_str(token)
                    .map(Osd::Uuid)
                    .map_err(|_| GridError::Malformed(format!("bad notation UUID {:?}", token)))
            }
            'd' => {
                self.bump()?;
                let raw = self.parse_quoted()?;
                parse_date(&raw)
                    .map(Osd::Date)
                    .ok_or_else(|| GridError::Malformed(format!("bad notation date {:?}", raw)))
            }
            'l' => {
                self.bump()?;
                Ok(Osd::Uri(self.parse_quoted()?))
            }
            'b' => {
                self.bump()?;
                if !self.eat_keyword("64") {
                    return Err(GridError::malformed(
                        "notation OSD: only base64 binary is supported",
                    ));
                }
                let raw = self.parse_quoted()?;
                base64_decode(&raw)
                    .map(Osd::Binary)
                    .ok_or_else(|| GridError::malformed("bad notation base64 binary"))
            }
            '[' => {
                self.bump()?;
                let mut items = Vec::new();
                loop {
                    self.skip_whitespace();
                    if self.peek() == Some(']') {
                        self.bump()?;
                        return Ok(Osd::Array(items));
                    }
                    items.push(self.parse_value()?);
                    self.skip_whitespace();
                    if self.peek() == Some(',') {
                        self.bump()?;
                    }
                }
            }
            '{' => {
                self.bump()?;
                let mut entries = rustc_hash::FxHashMap::default();
                loop {
                    self.skip_whitespace();
                    if self.peek() == Some('}') {
                        self.bump()?;
                        return Ok(Osd::Map(entries));
                    }
                    if self.peek() == Some('s') {
                        self.bump()?;
                    }
                    let key = self.parse_quoted()?;
                    self.skip_whitespace();
                    self.eat(':')?;
                    entries.insert(key, self.parse_value()?);
                    self.skip_whitespace();
                    if self.peek() == Some(',') {
                        self.bump()?;
                    }
                }
            }
            other => Err(GridError::Malformed(format!(
                "notation OSD: unexpected character {:?}",
                other
            ))),
        }
    }

    fn take_number_token(&mut self) -> &'a str {
        let end = self
            .rest
            .char_indices()
            .find(|&(_, c)| !matches!(c, '0'..='9' | '+' | '-' | '.' | 'e' | 'E' | 'a' | 'n' | 'N' | 'i' | 'f' | 'I'))
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (token, rest) = self.rest.split_at(end);
        self.rest = rest;
        token
    }

    fn parse_quoted(&mut self) -> Result<String> {
        self.skip_whitespace();
        let quote = self.bump()?;
        if quote != '\'' && quote != '"' {
            return Err(GridError::malformed("notation OSD: expected a quoted string"));
        }

        let mut out = String::new();
        loop {
            let c = self.bump()?;
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                out.push(self.bump()?);
            } else {
                out.push(c);
            }
        }
    }
}

fn split_uuid_token(rest: &str) -> Result<(&str, &str)> {
    if rest.len() < 36 || !rest.is_char_boundary(36) {
        return Err(GridError::malformed("truncated notation UUID"));
    }
    Ok(rest.split_at(36))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use rustc_hash::FxHashMap;

    use super::*;

    #[rstest]
    #[case::null(Osd::Null)]
    #[case::true_(Osd::Boolean(true))]
    #[case::false_(Osd::Boolean(false))]
    #[case::integer(Osd::Integer(-42))]
    #[case::real(Osd::Real(0.125))]
    #[case::real_negative(Osd::Real(-1.5e10))]
    #[case::string(Osd::from("plain"))]
    #[case::string_escapes(Osd::from(r"it's a \ test"))]
    #[case::uuid(Osd::Uuid(Uuid::parse_str("d7f4aeca-88f1-42a1-b385-b9db18abb255").unwrap()))]
    #[case::date(Osd::Date(parse_date("2006-02-01T14:29:53Z").unwrap()))]
    #[case::uri(Osd::Uri("https://example.com/a b".to_string()))]
    #[case::binary(Osd::Binary(vec![1, 2, 3, 250]))]
    #[case::array(Osd::Array(vec![Osd::Integer(1), Osd::Boolean(true), Osd::Null]))]
    #[case::nested(Osd::Array(vec![Osd::Array(vec![Osd::Real(1.0)]), Osd::from("x")]))]
    fn test_roundtrip(#[case] value: Osd) {
        let encoded = emit(&value);
        assert_eq!(parse(&encoded).unwrap(), value);
    }

    #[test]
    fn test_map_roundtrip() {
        let mut m = FxHashMap::default();
        m.insert("first".to_string(), Osd::Integer(1));
        m.insert("se'cond".to_string(), Osd::from("two"));
        let value = Osd::Map(m);

        assert_eq!(parse(&emit(&value)).unwrap(), value);
    }

    #[rstest]
    #[case::integer("i42", Osd::Integer(42))]
    #[case::negative("i-7", Osd::Integer(-7))]
    #[case::real("r3.5", Osd::Real(3.5))]
    #[case::keyword_true("true", Osd::Boolean(true))]
    #[case::keyword_false("false", Osd::Boolean(false))]
    #[case::bare_string("'hi'", Osd::from("hi"))]
    #[case::double_quoted("\"hi\"", Osd::from("hi"))]
    #[case::array_whitespace("[ i1 , i2 ]", Osd::Array(vec![Osd::Integer(1), Osd::Integer(2)]))]
    fn test_parse_forms(#[case] text: &str, #[case] expected: Osd) {
        assert_eq!(parse(text.as_bytes()).unwrap(), expected);
    }

    #[rstest]
    #[case::empty("")]
    #[case::stray_sigil("i")]
    #[case::bad_uuid("uzzzz")]
    #[case::unterminated_string("s'abc")]
    #[case::unterminated_array("[i1")]
    #[case::unsupported_binary("b16\"00ff\"")]
    fn test_parse_malformed(#[case] text: &str) {
        assert!(parse(text.as_bytes()).is_err());
    }
}
