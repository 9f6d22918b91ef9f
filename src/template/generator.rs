//! Renders Rust source from a parsed message template: per-message block structs,
//!  length / encode / decode bodies, and the packet-type enumeration with its
//!  factory arms.
//!
//! This is a development-time tool. The catalogue in [`crate::messages`] is its
//!  rendered output, checked in and maintained by hand since; the generator stays
//!  around to diff newly published template revisions against the catalogue.

use std::fmt::Write;

use crate::template::{BlockQuantity, FieldKind, MessageDescriptor, MessageTemplate};

/// Render the full catalogue module: packet-type enum, factory arms and one
///  struct set per kept message.
pub fn render(template: &MessageTemplate) -> String {
    let mut out = String::new();

    render_packet_type(template, &mut out);
    for msg in template.messages().filter(|m| !m.unused) {
        out.push('\n');
        render_message(msg, &mut out);
    }
    out
}

pub fn render_packet_type(template: &MessageTemplate, out: &mut String) {
    out.push_str("#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]\n");
    out.push_str("pub enum PacketType {\n");
    for msg in template.messages().filter(|m| !m.unused) {
        let _ = writeln!(out, "    {},", msg.name);
    }
    out.push_str("}\n\nimpl PacketType {\n    pub fn from_id(frequency: Frequency, id: u16) -> Option<PacketType> {\n        match (frequency, id) {\n");
    for msg in template.messages().filter(|m| !m.unused) {
        let _ = writeln!(
            out,
            "            (Frequency::{:?}, {}) => Some(PacketType::{}),",
            msg.frequency, msg.id, msg.name
        );
    }
    out.push_str("            _ => None,\n        }\n    }\n}\n");
}

pub fn render_message(msg: &MessageDescriptor, out: &mut String) {
    for block in &msg.blocks {
        let _ = writeln!(out, "#[derive(Debug, Clone, Default, PartialEq)]");
        let _ = writeln!(out, "pub struct {}{} {{", msg.name, block.name);
        for field in &block.fields {
            let _ = writeln!(out, "    pub {}: {},", snake_case(&field.name), rust_type(field.kind));
        }
        out.push_str("}\n\n");
    }

    let _ = writeln!(out, "#[derive(Debug, Clone, Default, PartialEq)]");
    let _ = writeln!(out, "pub struct {} {{", msg.name);
    for block in &msg.blocks {
        let _ = writeln!(out, "    pub {}: {},", snake_case(&block.name), block_field_type(msg, block.quantity, &block.name));
    }
    out.push_str("}\n\n");

    let _ = writeln!(out, "impl Packet for {} {{", msg.name);
    let _ = writeln!(out, "    const TYPE: PacketType = PacketType::{};\n", msg.name);
    render_length(msg, out);
    render_write_body(msg, out);
    render_read_body(msg, out);
    out.push_str("}\n");
}

fn block_field_type(msg: &MessageDescriptor, quantity: BlockQuantity, block_name: &str) -> String {
    let element = format!("{}{}", msg.name, block_name);
    match quantity {
        BlockQuantity::Single => element,
        BlockQuantity::Multiple(n) => format!("[{}; {}]", element, n),
        BlockQuantity::Variable => format!("Vec<{}>", element),
    }
}

fn render_length(msg: &MessageDescriptor, out: &mut String) {
    out.push_str("    fn length(&self) -> usize {\n        let mut len = 0;\n");
    for block in &msg.blocks {
        let occurrence = |access: &str, out: &mut String| {
            for field in &block.fields {
                match field.kind {
                    FieldKind::Variable(prefix) => {
                        let _ = writeln!(
                            out,
                            "        len += {} + {}.{}.len();",
                            prefix,
                            access,
                            snake_case(&field.name)
                        );
                    }
                    kind => {
                        let _ = writeln!(out, "        len += {};", kind.fixed_wire_len().unwrap_or(0));
                    }
                }
            }
        };
        let block_access = format!("self.{}", snake_case(&block.name));
        match block.quantity {
            BlockQuantity::Single => occurrence(&block_access, out),
            BlockQuantity::Multiple(_) | BlockQuantity::Variable => {
                if matches!(block.quantity, BlockQuantity::Variable) {
                    out.push_str("        len += 1;\n");
                }
                let _ = writeln!(out, "        for block in &{} {{", block_access);
                occurrence("block", out);
                out.push_str("        }\n");
            }
        }
    }
    out.push_str("        len\n    }\n\n");
}

fn render_write_body(msg: &MessageDescriptor, out: &mut String) {
    out.push_str("    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {\n");
    for block in &msg.blocks {
        let block_access = format!("self.{}", snake_case(&block.name));
        match block.quantity {
            BlockQuantity::Single => render_write_fields(msg, block, &block_access, out),
            BlockQuantity::Multiple(_) => {
                let _ = writeln!(out, "        for block in &{} {{", block_access);
                render_write_fields(msg, block, "block", out);
                out.push_str("        }\n");
            }
            BlockQuantity::Variable => {
                let _ = writeln!(out, "        put_block_count(buf, \"{}\", {}.len())?;", block.name, block_access);
                let _ = writeln!(out, "        for block in &{} {{", block_access);
                render_write_fields(msg, block, "block", out);
                out.push_str("        }\n");
            }
        }
    }
    out.push_str("        Ok(())\n    }\n\n");
}

fn render_write_fields(msg: &MessageDescriptor, block: &crate::template::BlockDescriptor, access: &str, out: &mut String) {
    for field in &block.fields {
        let name = snake_case(&field.name);
        let expr = match field.kind {
            FieldKind::Bool => format!("buf.put_u8({}.{} as u8);", access, name),
            FieldKind::U8 => format!("buf.put_u8({}.{});", access, name),
            FieldKind::S8 => format!("buf.put_i8({}.{});", access, name),
            FieldKind::U16 => format!("buf.put_u16_le({}.{});", access, name),
            FieldKind::S16 => format!("buf.put_i16_le({}.{});", access, name),
            FieldKind::U32 => format!("buf.put_u32_le({}.{});", access, name),
            FieldKind::S32 => format!("buf.put_i32_le({}.{});", access, name),
            FieldKind::U64 => format!("buf.put_u64_le({}.{});", access, name),
            FieldKind::F32 => format!("buf.put_f32_le({}.{});", access, name),
            FieldKind::F64 => format!("buf.put_f64_le({}.{});", access, name),
            FieldKind::IpAddr => format!("buf.put_ip_addr(&{}.{});", access, name),
            FieldKind::IpPort => format!("buf.put_ip_port({}.{});", access, name),
            FieldKind::Uuid => format!("buf.put_uuid(&{}.{});", access, name),
            FieldKind::Vector3 => format!("buf.put_vector3(&{}.{});", access, name),
            FieldKind::Vector3d => format!("buf.put_vector3d(&{}.{});", access, name),
            FieldKind::Vector4 => format!("buf.put_vector4(&{}.{});", access, name),
            FieldKind::Quaternion => format!("buf.put_quaternion(&{}.{});", access, name),
            FieldKind::Fixed(n) => format!(
                "buf.put_fixed(\"{}.{}\", {}, &{}.{})?;",
                msg.name, field.name, n, access, name
            ),
            FieldKind::Variable(1) => format!(
                "buf.put_variable1(\"{}.{}\", &{}.{})?;",
                msg.name, field.name, access, name
            ),
            FieldKind::Variable(_) => format!(
                "buf.put_variable2(\"{}.{}\", &{}.{})?;",
                msg.name, field.name, access, name
            ),
        };
        let _ = writeln!(out, "        {}", expr);
    }
}

fn render_read_body(msg: &MessageDescriptor, out: &mut String) {
    let _ = writeln!(out, "    fn read_body(buf: &mut &[u8]) -> Result<{}> {{", msg.name);
    for block in &msg.blocks {
        let name = snake_case(&block.name);
        match block.quantity {
            BlockQuantity::Single => {
                let _ = writeln!(out, "        let {} = {{", name);
                render_read_occurrence(msg, block, out);
                out.push_str("        };\n");
            }
            BlockQuantity::Multiple(n) => {
                let _ = writeln!(out, "        let {} = read_array::<_, {}>(buf, |buf| {{", name, n);
                render_read_occurrence(msg, block, out);
                out.push_str("        })?;\n");
            }
            BlockQuantity::Variable => {
                let _ = writeln!(out, "        let {} = read_blocks(buf, |buf| {{", name);
                render_read_occurrence(msg, block, out);
                out.push_str("        })?;\n");
            }
        }
    }
    let _ = writeln!(out, "        Ok({} {{", msg.name);
    for block in &msg.blocks {
        let _ = writeln!(out, "            {},", snake_case(&block.name));
    }
    out.push_str("        })\n    }\n");
}

fn render_read_occurrence(msg: &MessageDescriptor, block: &crate::template::BlockDescriptor, out: &mut String) {
    let struct_name = format!("{}{}", msg.name, block.name);
    let _ = writeln!(out, "            Ok::<_, GridError>({} {{", struct_name);
    for field in &block.fields {
        let expr = match field.kind {
            FieldKind::Bool => "buf.try_get_u8()? != 0".to_string(),
            FieldKind::U8 => "buf.try_get_u8()?".to_string(),
            FieldKind::S8 => "buf.try_get_i8()?".to_string(),
            FieldKind::U16 => "buf.try_get_u16_le()?".to_string(),
            FieldKind::S16 => "buf.try_get_i16_le()?".to_string(),
            FieldKind::U32 => "buf.try_get_u32_le()?".to_string(),
            FieldKind::S32 => "buf.try_get_i32_le()?".to_string(),
            FieldKind::U64 => "buf.try_get_u64_le()?".to_string(),
            FieldKind::F32 => "buf.try_get_f32_le()?".to_string(),
            FieldKind::F64 => "buf.try_get_f64_le()?".to_string(),
            FieldKind::IpAddr => "buf.try_ip_addr()?".to_string(),
            FieldKind::IpPort => "buf.try_ip_port()?".to_string(),
            FieldKind::Uuid => "buf.try_uuid()?".to_string(),
            FieldKind::Vector3 => "buf.try_vector3()?".to_string(),
            FieldKind::Vector3d => "buf.try_vector3d()?".to_string(),
            FieldKind::Vector4 => "buf.try_vector4()?".to_string(),
            FieldKind::Quaternion => "buf.try_quaternion()?".to_string(),
            FieldKind::Fixed(n) => format!("buf.try_fixed({})?", n),
            FieldKind::Variable(1) => "buf.try_variable1()?".to_string(),
            FieldKind::Variable(_) => "buf.try_variable2()?".to_string(),
        };
        let _ = writeln!(out, "                {}: {},", snake_case(&field.name), expr);
    }
    out.push_str("            })\n");
}

fn rust_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Bool => "bool",
        FieldKind::U8 => "u8",
        FieldKind::S8 => "i8",
        FieldKind::U16 => "u16",
        FieldKind::S16 => "i16",
        FieldKind::U32 => "u32",
        FieldKind::S32 => "i32",
        FieldKind::U64 => "u64",
        FieldKind::F32 => "f32",
        FieldKind::F64 => "f64",
        FieldKind::IpAddr => "[u8; 4]",
        FieldKind::IpPort => "u16",
        FieldKind::Uuid => "Uuid",
        FieldKind::Vector3 => "Vector3",
        FieldKind::Vector3d => "Vector3d",
        FieldKind::Vector4 => "Vector4",
        FieldKind::Quaternion => "Quaternion",
        FieldKind::Fixed(_) | FieldKind::Variable(_) => "Vec<u8>",
    }
}

/// `RegionHandle` -> `region_handle`, `ID` -> `id`, `SimIP` -> `sim_ip`
fn snake_case(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0 && chars[i - 1].is_ascii_lowercase();
            let next_lower = chars.get(i + 1).map(|n| n.is_ascii_lowercase()).unwrap_or(false);
            if i > 0 && (prev_lower || next_lower) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::simple("RegionHandle", "region_handle")]
    #[case::all_caps("ID", "id")]
    #[case::acronym_then_word("SimIP", "sim_ip")]
    #[case::acronym_inside("AgentID", "agent_id")]
    #[case::mixed("TimeDilation", "time_dilation")]
    #[case::single("X", "x")]
    fn test_snake_case(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(snake_case(input), expected);
    }

    const TEMPLATE: &str = "{ TestMessage Low 1 NotTrusted Zerocoded \
        { TestBlock1 Single { Test1 U32 } } \
        { NeighborBlock Multiple 4 { Test0 U32 } } }";

    #[test]
    fn test_render_structs() {
        let template = MessageTemplate::parse(TEMPLATE).unwrap();
        let source = render(&template);

        assert!(source.contains("pub struct TestMessageTestBlock1 {"));
        assert!(source.contains("    pub test1: u32,"));
        assert!(source.contains("pub struct TestMessage {"));
        assert!(source.contains("    pub neighbor_block: [TestMessageNeighborBlock; 4],"));
    }

    #[test]
    fn test_render_codec_bodies() {
        let template = MessageTemplate::parse(TEMPLATE).unwrap();
        let source = render(&template);

        assert!(source.contains("impl Packet for TestMessage {"));
        assert!(source.contains("fn length(&self) -> usize {"));
        assert!(source.contains("buf.put_u32_le(self.test_block1.test1);"));
        assert!(source.contains("buf.try_get_u32_le()?"));
    }

    #[test]
    fn test_render_packet_type() {
        let template = MessageTemplate::parse(TEMPLATE).unwrap();
        let source = render(&template);

        assert!(source.contains("pub enum PacketType {"));
        assert!(source.contains("    TestMessage,"));
        assert!(source.contains("(Frequency::Low, 1) => Some(PacketType::TestMessage),"));
    }

    #[test]
    fn test_unused_messages_not_rendered() {
        let mut template = MessageTemplate::parse(TEMPLATE).unwrap();
        template.mark_unused(&["TestMessage"]);
        let source = render(&template);

        assert!(!source.contains("pub struct TestMessage"));
    }

    #[test]
    fn test_variable_field_lengths() {
        let template = MessageTemplate::parse(
            "{ Chat Low 9 NotTrusted Unencoded { Data Single { Name Variable 1 } { Text Variable 2 } } }",
        )
        .unwrap();
        let source = render(&template);

        assert!(source.contains("len += 1 + self.data.name.len();"));
        assert!(source.contains("len += 2 + self.data.text.len();"));
        assert!(source.contains("buf.put_variable1(\"Chat.Name\""));
        assert!(source.contains("buf.put_variable2(\"Chat.Text\""));
    }
}
