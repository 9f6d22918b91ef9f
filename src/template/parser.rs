//! Line-oriented parser for the message-template manifest.
//!
//! The syntax is brace-structured: a message definition is a `{ ... }` group
//!  holding header tokens, followed by block groups which in turn hold field
//!  groups. Tokens outside groups (like the `version` directive) that the parser
//!  does not know are skipped.

use crate::error::{GridError, Result};
use crate::template::{
    BlockDescriptor, BlockQuantity, FieldDescriptor, FieldKind, Frequency, MessageDescriptor,
};

pub(super) fn parse(source: &str) -> Result<(String, Vec<MessageDescriptor>)> {
    let tokens = tokenize(source);
    let mut tokens = tokens.as_slice();

    let mut version = String::new();
    let mut messages = Vec::new();

    while let Some((token, rest)) = tokens.split_first() {
        tokens = rest;
        match token.as_str() {
            "version" => {
                if let Some((v, rest)) = tokens.split_first() {
                    version = v.clone();
                    tokens = rest;
                }
            }
            "{" => {
                let (message, rest) = parse_message(tokens)?;
                messages.push(message);
                tokens = rest;
            }
            // unknown directive - skip it
            _ => {}
        }
    }

    Ok((version, messages))
}

fn tokenize(source: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for line in source.lines() {
        let line = line.split("//").next().unwrap_or("");
        for word in line.split_whitespace() {
            tokens.push(word.to_string());
        }
    }
    tokens
}

fn parse_message(mut tokens: &[String]) -> Result<(MessageDescriptor, &[String])> {
    let name = next_token(&mut tokens, "message name")?;
    let frequency = parse_frequency(&next_token(&mut tokens, "message frequency")?)?;
    let id = parse_id(&next_token(&mut tokens, "message id")?, frequency)?;
    let trusted = match next_token(&mut tokens, "trust level")?.as_str() {
        "Trusted" => true,
        "NotTrusted" => false,
        other => {
            return Err(GridError::Malformed(format!(
                "message {}: unknown trust level {:?}",
                name, other
            )))
        }
    };
    let zerocoded = match next_token(&mut tokens, "encoding")?.as_str() {
        "Zerocoded" => true,
        "Unencoded" => false,
        other => {
            return Err(GridError::Malformed(format!(
                "message {}: unknown encoding {:?}",
                name, other
            )))
        }
    };

    let mut blocks = Vec::new();
    loop {
        let token = next_token(&mut tokens, "block or closing brace")?;
        match token.as_str() {
            "}" => break,
            "{" => {
                let (block, rest) = parse_block(tokens, &name)?;
                blocks.push(block);
                tokens = rest;
            }
            // trailing annotations like Deprecated / UDPBlackListed
            _ => {}
        }
    }

    Ok((
        MessageDescriptor {
            name,
            frequency,
            id,
            trusted,
            zerocoded,
            unused: false,
            blocks,
        },
        tokens,
    ))
}

fn parse_block<'a>(
    mut tokens: &'a [String],
    message_name: &str,
) -> Result<(BlockDescriptor, &'a [String])> {
    let name = next_token(&mut tokens, "block name")?;
    let quantity = match next_token(&mut tokens, "block quantity")?.as_str() {
        "Single" => BlockQuantity::Single,
        "Variable" => BlockQuantity::Variable,
        "Multiple" => {
            let count_token = next_token(&mut tokens, "block multiplicity")?;
            let count = count_token.parse::<u8>().map_err(|_| {
                GridError::Malformed(format!(
                    "{}.{}: bad block multiplicity {:?}",
                    message_name, name, count_token
                ))
            })?;
            BlockQuantity::Multiple(count)
        }
        other => {
            return Err(GridError::Malformed(format!(
                "{}.{}: unknown block quantity {:?}",
                message_name, name, other
            )))
        }
    };

    let mut fields = Vec::new();
    loop {
        let token = next_token(&mut tokens, "field or closing brace")?;
        match token.as_str() {
            "}" => break,
            "{" => {
                let (field, rest) = parse_field(tokens, message_name, &name)?;
                fields.push(field);
                tokens = rest;
            }
            _ => {}
        }
    }

    Ok((
        BlockDescriptor {
            name,
            quantity,
            fields,
        },
        tokens,
    ))
}

fn parse_field<'a>(
    mut tokens: &'a [String],
    message_name: &str,
    block_name: &str,
) -> Result<(FieldDescriptor, &'a [String])> {
    let name = next_token(&mut tokens, "field name")?;
    let type_token = next_token(&mut tokens, "field type")?;

    let kind = match type_token.as_str() {
        "BOOL" => FieldKind::Bool,
        "U8" => FieldKind::U8,
        "S8" => FieldKind::S8,
        "U16" => FieldKind::U16,
        "S16" => FieldKind::S16,
        "U32" => FieldKind::U32,
        "S32" => FieldKind::S32,
        "U64" => FieldKind::U64,
        "F32" => FieldKind::F32,
        "F64" => FieldKind::F64,
        "IPADDR" => FieldKind::IpAddr,
        "IPPORT" => FieldKind::IpPort,
        "LLUUID" => FieldKind::Uuid,
        "LLVector3" => FieldKind::Vector3,
        "LLVector3d" => FieldKind::Vector3d,
        "LLVector4" => FieldKind::Vector4,
        "LLQuaternion" => FieldKind::Quaternion,
        "Fixed" => {
            let count = parse_count(&mut tokens, message_name, block_name, &name)?;
            FieldKind::Fixed(count)
        }
        "Variable" => {
            let count = parse_count(&mut tokens, message_name, block_name, &name)?;
            FieldKind::Variable(count as u8)
        }
        other => {
            return Err(GridError::Malformed(format!(
                "{}.{}.{}: unknown field type {:?}",
                message_name, block_name, name, other
            )))
        }
    };

    loop {
        let token = next_token(&mut tokens, "closing brace")?;
        if token == "}" {
            break;
        }
    }

    Ok((FieldDescriptor { name, kind }, tokens))
}

fn parse_count(
    tokens: &mut &[String],
    message_name: &str,
    block_name: &str,
    field_name: &str,
) -> Result<u16> {
    let token = next_token(tokens, "field count")?;
    token.parse::<u16>().map_err(|_| {
        GridError::Malformed(format!(
            "{}.{}.{}: bad field count {:?}",
            message_name, block_name, field_name, token
        ))
    })
}

fn parse_frequency(token: &str) -> Result<Frequency> {
    match token {
        "High" => Ok(Frequency::High),
        "Medium" => Ok(Frequency::Medium),
        "Low" => Ok(Frequency::Low),
        "Fixed" => Ok(Frequency::Fixed),
        other => Err(GridError::Malformed(format!(
            "unknown frequency class {:?}",
            other
        ))),
    }
}

fn parse_id(token: &str, frequency: Frequency) -> Result<u16> {
    let raw = if let Some(hex) = token.strip_prefix("0x") {
        u32::from_str_radix(hex, 16)
            .map_err(|_| GridError::Malformed(format!("bad message id {:?}", token)))?
    } else {
        token
            .parse::<u32>()
            .map_err(|_| GridError::Malformed(format!("bad message id {:?}", token)))?
    };

    // Fixed ids are written as 0xFFFFFFxx literals; only the low byte is the id
    let id = match frequency {
        Frequency::Fixed => raw & 0xFF,
        _ => raw,
    };
    u16::try_from(id).map_err(|_| GridError::Malformed(format!("message id {:?} out of range", token)))
}

fn next_token(tokens: &mut &[String], expected: &str) -> Result<String> {
    let (token, rest) = tokens
        .split_first()
        .ok_or_else(|| GridError::Malformed(format!("template ends while expecting {}", expected)))?;
    *tokens = rest;
    Ok(token.clone())
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_tokenize_strips_comments() {
        let tokens = tokenize("a b // comment\n{ c }");
        assert_eq!(tokens, vec!["a", "b", "{", "c", "}"]);
    }

    #[test]
    fn test_field_with_count() {
        let (_, messages) =
            parse("{ M High 7 Trusted Unencoded { B Single { F Fixed 32 } { G Variable 2 } } }").unwrap();
        let fields = &messages[0].blocks[0].fields;
        assert_eq!(fields[0].kind, FieldKind::Fixed(32));
        assert_eq!(fields[1].kind, FieldKind::Variable(2));
    }

    #[test]
    fn test_trailing_annotations_ignored() {
        let (_, messages) =
            parse("{ M Low 5 NotTrusted Unencoded UDPDeprecated { B Single { F U8 } } }").unwrap();
        assert_eq!(messages[0].blocks.len(), 1);
    }

    #[test]
    fn test_unknown_directive_skipped() {
        let (version, messages) =
            parse("flavor llsd\nversion 2.0\n{ M Low 5 NotTrusted Unencoded { B Single { F U8 } } }")
                .unwrap();
        assert_eq!(version, "2.0");
        assert_eq!(messages.len(), 1);
    }

    #[rstest]
    #[case::bad_frequency("{ M Weekly 5 NotTrusted Unencoded { B Single { F U8 } } }")]
    #[case::bad_type("{ M Low 5 NotTrusted Unencoded { B Single { F U9 } } }")]
    #[case::missing_count("{ M Low 5 NotTrusted Unencoded { B Single { F Fixed } } }")]
    #[case::unterminated("{ M Low 5 NotTrusted Unencoded { B Single { F U8 }")]
    fn test_parse_errors(#[case] source: &str) {
        assert!(parse(source).is_err());
    }

    #[test]
    fn test_fixed_id_low_byte() {
        let (_, messages) =
            parse("{ M Fixed 0xFFFFFFFD NotTrusted Unencoded { B Single { F U8 } } }").unwrap();
        assert_eq!(messages[0].id, 0xFD);
    }
}
