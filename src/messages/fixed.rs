//! Fixed-id messages (0xFFFFFFxx): circuit plumbing that exists below the normal
//!  message numbering.

use bytes::{Buf, BufMut};

use crate::error::Result;
use crate::messages::{put_block_count, read_blocks, split_occurrences, Packet, PacketType};
use crate::wire::codec::{WireReadExt, WireWriteExt};

/// Explicit acknowledgement of received reliable sequence numbers, used when
///  there is no outgoing traffic to piggyback on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketAckPackets {
    pub id: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketAck {
    pub packets: Vec<PacketAckPackets>,
}

impl PacketAck {
    const FIXED_LEN: usize = 1;

    pub fn for_sequences(sequences: impl IntoIterator<Item = u32>) -> PacketAck {
        PacketAck {
            packets: sequences
                .into_iter()
                .map(|id| PacketAckPackets { id })
                .collect(),
        }
    }

    pub fn sequences(&self) -> impl Iterator<Item = u32> + '_ {
        self.packets.iter().map(|block| block.id)
    }
}

impl Packet for PacketAck {
    const TYPE: PacketType = PacketType::PacketAck;

    fn length(&self) -> usize {
        Self::FIXED_LEN + 4 * self.packets.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        put_block_count(buf, "PacketAck.Packets", self.packets.len())?;
        for block in &self.packets {
            buf.put_u32_le(block.id);
        }
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<PacketAck> {
        Ok(PacketAck {
            packets: read_blocks(buf, |buf| {
                Ok(PacketAckPackets {
                    id: buf.try_get_u32_le()?,
                })
            })?,
        })
    }

    fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        if self.length() <= budget {
            return Ok(vec![self.to_bytes()?]);
        }

        split_occurrences(&self.packets, Self::FIXED_LEN, budget, |_| 4)
            .into_iter()
            .map(|packets| PacketAck { packets }.to_bytes())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenCircuitCircuitInfo {
    pub ip: [u8; 4],
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpenCircuit {
    pub circuit_info: OpenCircuitCircuitInfo,
}

impl Packet for OpenCircuit {
    const TYPE: PacketType = PacketType::OpenCircuit;

    fn length(&self) -> usize {
        6
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_ip_addr(&self.circuit_info.ip);
        buf.put_ip_port(self.circuit_info.port);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<OpenCircuit> {
        Ok(OpenCircuit {
            circuit_info: OpenCircuitCircuitInfo {
                ip: buf.try_ip_addr()?,
                port: buf.try_ip_port()?,
            },
        })
    }
}

/// Immediate, unacknowledged teardown of the circuit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseCircuit;

impl Packet for CloseCircuit {
    const TYPE: PacketType = PacketType::CloseCircuit;

    fn length(&self) -> usize {
        0
    }

    fn write_body(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn read_body(_buf: &mut &[u8]) -> Result<CloseCircuit> {
        Ok(CloseCircuit)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::messages::Message;

    use super::*;

    #[rstest]
    #[case::empty_ack(Message::PacketAck(PacketAck::for_sequences([])))]
    #[case::acks(Message::PacketAck(PacketAck::for_sequences([1, 2, 0xFFFF_FFFF])))]
    #[case::open(Message::OpenCircuit(OpenCircuit {
        circuit_info: OpenCircuitCircuitInfo { ip: [192, 168, 0, 1], port: 13000 },
    }))]
    #[case::close(Message::CloseCircuit(CloseCircuit))]
    fn test_roundtrip_and_length_law(#[case] message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.length());
        assert_eq!(Message::read(message.packet_type(), &bytes).unwrap(), message);
    }

    #[test]
    fn test_ack_wire_format() {
        let bytes = PacketAck::for_sequences([0x01020304]).to_bytes().unwrap();
        // one occurrence, little-endian id
        assert_eq!(bytes, vec![1, 4, 3, 2, 1]);
    }

    #[test]
    fn test_ack_split() {
        let ack = PacketAck::for_sequences(0..300u32);
        let fragments = ack.to_bytes_multiple(101).unwrap();

        let mut reassembled = Vec::new();
        for fragment in &fragments {
            assert!(fragment.len() <= 101);
            let decoded = PacketAck::read_body(&mut fragment.as_slice()).unwrap();
            reassembled.extend(decoded.sequences());
        }
        assert_eq!(reassembled, (0..300).collect::<Vec<_>>());
    }

    #[test]
    fn test_ack_block_count_capped() {
        let ack = PacketAck::for_sequences(0..300u32);
        assert!(ack.to_bytes().is_err());
    }
}
