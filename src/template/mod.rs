//! The message descriptor model: an in-memory representation of the protocol's
//!  message dictionary, parsed from the plain-text message-template manifest.
//!
//! The model drives the code generator in [`generator`]; the checked-in catalogue
//!  in [`crate::messages`] is its rendered (and then maintained) output.

pub mod generator;
mod parser;

use rustc_hash::FxHashMap;

use crate::error::{GridError, Result};

/// Frequency class of a message, which determines the width of its id on the wire.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Frequency {
    High,
    Medium,
    Low,
    Fixed,
}

impl Frequency {
    /// number of message-id bytes following the datagram header
    pub fn id_bytes(self) -> usize {
        match self {
            Frequency::High => 1,
            Frequency::Medium => 2,
            Frequency::Low => 4,
            Frequency::Fixed => 4,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockQuantity {
    /// exactly one occurrence
    Single,
    /// a fixed number of occurrences, n >= 2
    Multiple(u8),
    /// a runtime count, prefixed on the wire by one byte (0..=255)
    Variable,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FieldKind {
    Bool,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    U64,
    F32,
    F64,
    /// 4 opaque bytes, never byte-swapped
    IpAddr,
    /// big-endian u16, unlike every other integer on the wire
    IpPort,
    Uuid,
    Vector3,
    Vector3d,
    Vector4,
    /// packed as three f32; W is reconstructed on decode
    Quaternion,
    /// exactly `n` raw bytes
    Fixed(u16),
    /// length-prefixed bytes; the value is the prefix width in bytes (1 or 2)
    Variable(u8),
}

impl FieldKind {
    /// wire length excluding any runtime-variable payload; `None` for `Variable`
    pub fn fixed_wire_len(self) -> Option<usize> {
        match self {
            FieldKind::Bool | FieldKind::U8 | FieldKind::S8 => Some(1),
            FieldKind::U16 | FieldKind::S16 | FieldKind::IpPort => Some(2),
            FieldKind::U32 | FieldKind::S32 | FieldKind::F32 | FieldKind::IpAddr => Some(4),
            FieldKind::U64 | FieldKind::F64 => Some(8),
            FieldKind::Uuid => Some(16),
            FieldKind::Vector3 | FieldKind::Quaternion => Some(12),
            FieldKind::Vector3d => Some(24),
            FieldKind::Vector4 => Some(16),
            FieldKind::Fixed(n) => Some(n as usize),
            FieldKind::Variable(_) => None,
        }
    }

    /// width of the length prefix for `Variable` fields, 0 otherwise
    pub fn prefix_len(self) -> usize {
        match self {
            FieldKind::Variable(n) => n as usize,
            _ => 0,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockDescriptor {
    pub name: String,
    pub quantity: BlockQuantity,
    pub fields: Vec<FieldDescriptor>,
}

impl BlockDescriptor {
    /// wire length of a single occurrence, assuming empty variable payloads
    pub fn min_occurrence_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.kind.fixed_wire_len().unwrap_or(0) + f.kind.prefix_len())
            .sum()
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MessageDescriptor {
    pub name: String,
    pub frequency: Frequency,
    pub id: u16,
    pub trusted: bool,
    pub zerocoded: bool,
    /// listed as unused: the id stays reserved but no code is generated
    pub unused: bool,
    pub blocks: Vec<BlockDescriptor>,
}

/// The parsed message dictionary with name and id indices.
#[derive(Debug, Default)]
pub struct MessageTemplate {
    pub version: String,
    messages: Vec<MessageDescriptor>,
    by_name: FxHashMap<String, usize>,
    by_id: FxHashMap<(Frequency, u16), usize>,
}

impl MessageTemplate {
    pub fn parse(source: &str) -> Result<MessageTemplate> {
        let (version, messages) = parser::parse(source)?;
        Self::from_messages(version, messages)
    }

    fn from_messages(version: String, messages: Vec<MessageDescriptor>) -> Result<MessageTemplate> {
        let mut template = MessageTemplate {
            version,
            messages,
            by_name: Default::default(),
            by_id: Default::default(),
        };
        template.build_indices()?;
        template.validate()?;
        Ok(template)
    }

    fn build_indices(&mut self) -> Result<()> {
        for (idx, msg) in self.messages.iter().enumerate() {
            if self.by_name.insert(msg.name.clone(), idx).is_some() {
                return Err(GridError::Malformed(format!(
                    "duplicate message name {:?} in template",
                    msg.name
                )));
            }
            if self.by_id.insert((msg.frequency, msg.id), idx).is_some() {
                return Err(GridError::Malformed(format!(
                    "duplicate id {} in frequency class {:?}",
                    msg.id, msg.frequency
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        for msg in &self.messages {
            for block in &msg.blocks {
                if let BlockQuantity::Multiple(n) = block.quantity {
                    if n < 2 {
                        return Err(GridError::Malformed(format!(
                            "{}.{}: Multiple blocks need a count of at least 2",
                            msg.name, block.name
                        )));
                    }
                }
                for field in &block.fields {
                    match field.kind {
                        FieldKind::Variable(n) if n != 1 && n != 2 => {
                            return Err(GridError::Malformed(format!(
                                "{}.{}.{}: Variable fields carry a 1 or 2 byte prefix, not {}",
                                msg.name, block.name, field.name, n
                            )));
                        }
                        FieldKind::Fixed(0) => {
                            return Err(GridError::Malformed(format!(
                                "{}.{}.{}: Fixed fields need a length of at least 1",
                                msg.name, block.name, field.name
                            )));
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Mark the given messages as unused. Their descriptors (and ids) stay in the
    ///  model, but the generator skips them.
    pub fn mark_unused(&mut self, names: &[&str]) {
        for msg in &mut self.messages {
            if names.contains(&msg.name.as_str()) {
                msg.unused = true;
            }
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageDescriptor> {
        self.messages.iter()
    }

    pub fn message(&self, name: &str) -> Option<&MessageDescriptor> {
        self.by_name.get(name).map(|&idx| &self.messages[idx])
    }

    pub fn message_by_id(&self, frequency: Frequency, id: u16) -> Option<&MessageDescriptor> {
        self.by_id
            .get(&(frequency, id))
            .map(|&idx| &self.messages[idx])
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    const SMALL_TEMPLATE: &str = r#"
version 2.0

{
    TestMessage Low 1 NotTrusted Zerocoded
    {
        TestBlock1 Single
        {   Test1    U32    }
    }
    {
        NeighborBlock Multiple 4
        {   Test0    U32    }
        {   Test1    U32    }
    }
}

// comments are ignored
{
    PacketAck Fixed 0xFFFFFFFB NotTrusted Unencoded
    {
        Packets Variable
        {   ID    U32    }
    }
}
"#;

    #[test]
    fn test_parse_small_template() {
        let template = MessageTemplate::parse(SMALL_TEMPLATE).unwrap();
        assert_eq!(template.version, "2.0");
        assert_eq!(template.len(), 2);

        let msg = template.message("TestMessage").unwrap();
        assert_eq!(msg.frequency, Frequency::Low);
        assert_eq!(msg.id, 1);
        assert!(!msg.trusted);
        assert!(msg.zerocoded);
        assert_eq!(msg.blocks.len(), 2);
        assert_eq!(msg.blocks[1].quantity, BlockQuantity::Multiple(4));

        let ack = template.message_by_id(Frequency::Fixed, 0xFB).unwrap();
        assert_eq!(ack.name, "PacketAck");
        assert_eq!(ack.blocks[0].quantity, BlockQuantity::Variable);
        assert!(!ack.zerocoded);
    }

    #[test]
    fn test_mark_unused_keeps_id_reserved() {
        let mut template = MessageTemplate::parse(SMALL_TEMPLATE).unwrap();
        template.mark_unused(&["TestMessage"]);

        let msg = template.message("TestMessage").unwrap();
        assert!(msg.unused);
        assert!(template.message_by_id(Frequency::Low, 1).is_some());
    }

    #[rstest]
    #[case::duplicate_name(
        "{ A Low 1 NotTrusted Unencoded { B Single { F U8 } } }\n{ A Low 2 NotTrusted Unencoded { B Single { F U8 } } }"
    )]
    #[case::duplicate_id(
        "{ A Low 1 NotTrusted Unencoded { B Single { F U8 } } }\n{ C Low 1 NotTrusted Unencoded { B Single { F U8 } } }"
    )]
    #[case::variable_bad_prefix("{ A Low 1 NotTrusted Unencoded { B Single { F Variable 3 } } }")]
    #[case::fixed_zero_len("{ A Low 1 NotTrusted Unencoded { B Single { F Fixed 0 } } }")]
    #[case::multiple_of_one("{ A Low 1 NotTrusted Unencoded { B Multiple 1 { F U8 } } }")]
    fn test_validation_rejects(#[case] source: &str) {
        assert!(MessageTemplate::parse(source).is_err());
    }

    #[test]
    fn test_ids_unique_only_within_frequency() {
        let source = "{ A Low 1 NotTrusted Unencoded { B Single { F U8 } } }\n\
                      { C High 1 NotTrusted Unencoded { B Single { F U8 } } }";
        let template = MessageTemplate::parse(source).unwrap();
        assert_eq!(template.len(), 2);
    }

    #[rstest]
    #[case::high(Frequency::High, 1)]
    #[case::medium(Frequency::Medium, 2)]
    #[case::low(Frequency::Low, 4)]
    #[case::fixed(Frequency::Fixed, 4)]
    fn test_id_bytes(#[case] frequency: Frequency, #[case] expected: usize) {
        assert_eq!(frequency.id_bytes(), expected);
    }

    #[test]
    fn test_min_occurrence_len() {
        let template = MessageTemplate::parse(
            "{ A Low 9 NotTrusted Unencoded { B Single { F1 LLUUID } { F2 Variable 2 } { F3 U16 } } }",
        )
        .unwrap();
        let block = &template.message("A").unwrap().blocks[0];
        assert_eq!(block.min_occurrence_len(), 16 + 2 + 2);
    }
}
