//! High-frequency messages (one-byte wire id): movement, pings, object and layer
//!  streams - the traffic that dominates a live circuit.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::Result;
use crate::messages::{put_block_count, read_blocks, split_occurrences, Packet, PacketType};
use crate::types::{Quaternion, Vector3};
use crate::wire::codec::{WireReadExt, WireWriteExt};

/// Liveness probe from either side. The peer answers with [`CompletePingCheck`]
///  echoing the ping id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartPingCheckPingId {
    pub ping_id: u8,
    /// lowest sequence number the sender still has pending, letting the receiver
    ///  drop stale entries from its ack bookkeeping
    pub oldest_unacked: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartPingCheck {
    pub ping_id: StartPingCheckPingId,
}

impl Packet for StartPingCheck {
    const TYPE: PacketType = PacketType::StartPingCheck;

    fn length(&self) -> usize {
        5
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u8(self.ping_id.ping_id);
        buf.put_u32_le(self.ping_id.oldest_unacked);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<StartPingCheck> {
        Ok(StartPingCheck {
            ping_id: StartPingCheckPingId {
                ping_id: buf.try_get_u8()?,
                oldest_unacked: buf.try_get_u32_le()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletePingCheckPingId {
    pub ping_id: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletePingCheck {
    pub ping_id: CompletePingCheckPingId,
}

impl Packet for CompletePingCheck {
    const TYPE: PacketType = PacketType::CompletePingCheck;

    fn length(&self) -> usize {
        1
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u8(self.ping_id.ping_id);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<CompletePingCheck> {
        Ok(CompletePingCheck {
            ping_id: CompletePingCheckPingId {
                ping_id: buf.try_get_u8()?,
            },
        })
    }
}

/// Periodic avatar state report: camera frame, rotations and control flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdateAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub body_rotation: Quaternion,
    pub head_rotation: Quaternion,
    pub state: u8,
    pub camera_center: Vector3,
    pub camera_at_axis: Vector3,
    pub camera_left_axis: Vector3,
    pub camera_up_axis: Vector3,
    pub far: f32,
    pub control_flags: u32,
    pub flags: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentUpdate {
    pub agent_data: AgentUpdateAgentData,
}

impl Packet for AgentUpdate {
    const TYPE: PacketType = PacketType::AgentUpdate;

    fn length(&self) -> usize {
        114
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        let data = &self.agent_data;
        buf.put_uuid(&data.agent_id);
        buf.put_uuid(&data.session_id);
        buf.put_quaternion(&data.body_rotation);
        buf.put_quaternion(&data.head_rotation);
        buf.put_u8(data.state);
        buf.put_vector3(&data.camera_center);
        buf.put_vector3(&data.camera_at_axis);
        buf.put_vector3(&data.camera_left_axis);
        buf.put_vector3(&data.camera_up_axis);
        buf.put_f32_le(data.far);
        buf.put_u32_le(data.control_flags);
        buf.put_u8(data.flags);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<AgentUpdate> {
        Ok(AgentUpdate {
            agent_data: AgentUpdateAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
                body_rotation: buf.try_quaternion()?,
                head_rotation: buf.try_quaternion()?,
                state: buf.try_get_u8()?,
                camera_center: buf.try_vector3()?,
                camera_at_axis: buf.try_vector3()?,
                camera_left_axis: buf.try_vector3()?,
                camera_up_axis: buf.try_vector3()?,
                far: buf.try_get_f32_le()?,
                control_flags: buf.try_get_u32_le()?,
                flags: buf.try_get_u8()?,
            },
        })
    }
}

/// A bit-packed terrain / wind / cloud patch; the payload is produced and consumed
///  by the layer codecs on top of [`crate::bitpack`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerDataLayerId {
    pub layer_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerDataLayerData {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LayerData {
    pub layer_id: LayerDataLayerId,
    pub layer_data: LayerDataLayerData,
}

impl Packet for LayerData {
    const TYPE: PacketType = PacketType::LayerData;

    fn length(&self) -> usize {
        1 + 2 + self.layer_data.data.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u8(self.layer_id.layer_type);
        buf.put_variable2("LayerData.Data", &self.layer_data.data)?;
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<LayerData> {
        Ok(LayerData {
            layer_id: LayerDataLayerId {
                layer_type: buf.try_get_u8()?,
            },
            layer_data: LayerDataLayerData {
                data: buf.try_variable2()?,
            },
        })
    }
}

/// Full object state for one or more scene objects. The object list is the
///  prototypical variable-multiplicity block and the main client of MTU splitting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdateRegionData {
    pub region_handle: u64,
    pub time_dilation: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdateObjectData {
    pub id: u32,
    pub state: u8,
    pub full_id: Uuid,
    pub crc: u32,
    pub pcode: u8,
    pub material: u8,
    pub scale: Vector3,
    pub position: Vector3,
    pub rotation: Quaternion,
    pub flags: u32,
    pub object_data: Vec<u8>,
    pub name_value: Vec<u8>,
    pub text: Vec<u8>,
    pub extra_params: Vec<u8>,
}

impl ObjectUpdateObjectData {
    fn wire_len(&self) -> usize {
        4 + 1 + 16 + 4 + 1 + 1 + 12 + 12 + 12 + 4
            + 1 + self.object_data.len()
            + 2 + self.name_value.len()
            + 1 + self.text.len()
            + 1 + self.extra_params.len()
    }

    fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32_le(self.id);
        buf.put_u8(self.state);
        buf.put_uuid(&self.full_id);
        buf.put_u32_le(self.crc);
        buf.put_u8(self.pcode);
        buf.put_u8(self.material);
        buf.put_vector3(&self.scale);
        buf.put_vector3(&self.position);
        buf.put_quaternion(&self.rotation);
        buf.put_u32_le(self.flags);
        buf.put_variable1("ObjectUpdate.ObjectData", &self.object_data)?;
        buf.put_variable2("ObjectUpdate.NameValue", &self.name_value)?;
        buf.put_variable1("ObjectUpdate.Text", &self.text)?;
        buf.put_variable1("ObjectUpdate.ExtraParams", &self.extra_params)?;
        Ok(())
    }

    fn read(buf: &mut &[u8]) -> Result<ObjectUpdateObjectData> {
        Ok(ObjectUpdateObjectData {
            id: buf.try_get_u32_le()?,
            state: buf.try_get_u8()?,
            full_id: buf.try_uuid()?,
            crc: buf.try_get_u32_le()?,
            pcode: buf.try_get_u8()?,
            material: buf.try_get_u8()?,
            scale: buf.try_vector3()?,
            position: buf.try_vector3()?,
            rotation: buf.try_quaternion()?,
            flags: buf.try_get_u32_le()?,
            object_data: buf.try_variable1()?,
            name_value: buf.try_variable2()?,
            text: buf.try_variable1()?,
            extra_params: buf.try_variable1()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdate {
    pub region_data: ObjectUpdateRegionData,
    pub object_data: Vec<ObjectUpdateObjectData>,
}

impl ObjectUpdate {
    /// region block plus the occurrence-count byte
    const FIXED_LEN: usize = 8 + 2 + 1;
}

impl Packet for ObjectUpdate {
    const TYPE: PacketType = PacketType::ObjectUpdate;

    fn length(&self) -> usize {
        Self::FIXED_LEN + self.object_data.iter().map(|b| b.wire_len()).sum::<usize>()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u64_le(self.region_data.region_handle);
        buf.put_u16_le(self.region_data.time_dilation);
        put_block_count(buf, "ObjectUpdate.ObjectData", self.object_data.len())?;
        for block in &self.object_data {
            block.write(buf)?;
        }
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<ObjectUpdate> {
        Ok(ObjectUpdate {
            region_data: ObjectUpdateRegionData {
                region_handle: buf.try_get_u64_le()?,
                time_dilation: buf.try_get_u16_le()?,
            },
            object_data: read_blocks(buf, ObjectUpdateObjectData::read)?,
        })
    }

    fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        if self.length() <= budget {
            return Ok(vec![self.to_bytes()?]);
        }

        split_occurrences(&self.object_data, Self::FIXED_LEN, budget, |b| b.wire_len())
            .into_iter()
            .map(|object_data| {
                ObjectUpdate {
                    region_data: self.region_data.clone(),
                    object_data,
                }
                .to_bytes()
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::messages::Message;

    use super::*;

    fn object_block(id: u32, payload_len: usize) -> ObjectUpdateObjectData {
        ObjectUpdateObjectData {
            id,
            state: 3,
            full_id: Uuid::new_v4(),
            crc: 0xCAFE,
            pcode: 9,
            material: 1,
            scale: Vector3::new(1.0, 1.0, 1.0),
            position: Vector3::new(128.0, 128.0, 25.5),
            rotation: Quaternion::new(0.5, 0.5, 0.5, 0.5),
            flags: 7,
            object_data: vec![0xAA; payload_len],
            name_value: b"Title STRING RW SV test".to_vec(),
            text: Vec::new(),
            extra_params: vec![1],
        }
    }

    #[rstest]
    #[case::ping(Message::StartPingCheck(StartPingCheck {
        ping_id: StartPingCheckPingId { ping_id: 7, oldest_unacked: 1234 },
    }))]
    #[case::pong(Message::CompletePingCheck(CompletePingCheck {
        ping_id: CompletePingCheckPingId { ping_id: 7 },
    }))]
    #[case::agent_update(Message::AgentUpdate(AgentUpdate {
        agent_data: AgentUpdateAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            body_rotation: Quaternion::new(0.5, 0.5, 0.5, 0.5),
            far: 64.0,
            control_flags: 0x0800,
            ..Default::default()
        },
    }))]
    #[case::layer_data(Message::LayerData(LayerData {
        layer_id: LayerDataLayerId { layer_type: b'L' },
        layer_data: LayerDataLayerData { data: vec![1, 2, 3, 0, 0, 9] },
    }))]
    #[case::object_update(Message::ObjectUpdate(ObjectUpdate {
        region_data: ObjectUpdateRegionData { region_handle: 42, time_dilation: 65535 },
        object_data: vec![object_block(1, 12), object_block(2, 0)],
    }))]
    fn test_roundtrip_and_length_law(#[case] message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.length());

        let decoded = Message::read(message.packet_type(), &bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_quaternion_w_reconstruction() {
        let mut original = AgentUpdate::default();
        original.agent_data.body_rotation = Quaternion::new(0.5, 0.5, 0.5, 0.5);

        let bytes = original.to_bytes().unwrap();
        let decoded = AgentUpdate::read_body(&mut bytes.as_slice()).unwrap();
        let q = decoded.agent_data.body_rotation;
        assert!((q.w - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_truncated_body_is_malformed() {
        let bytes = StartPingCheck::default().to_bytes().unwrap();
        assert!(Message::read(PacketType::StartPingCheck, &bytes[..3]).is_err());
    }

    #[test]
    fn test_object_update_split_reassembles() {
        let original = ObjectUpdate {
            region_data: ObjectUpdateRegionData { region_handle: 9, time_dilation: 100 },
            object_data: (0..20).map(|i| object_block(i, 120)).collect(),
        };
        let budget = 600;

        let fragments = original.to_bytes_multiple(budget).unwrap();
        assert!(fragments.len() > 1);

        let mut reassembled = Vec::new();
        for fragment in &fragments {
            assert!(fragment.len() <= budget);
            let decoded = ObjectUpdate::read_body(&mut fragment.as_slice()).unwrap();
            // the fixed region block is duplicated verbatim into every fragment
            assert_eq!(decoded.region_data, original.region_data);
            reassembled.extend(decoded.object_data);
        }
        assert_eq!(reassembled, original.object_data);
    }

    #[test]
    fn test_object_update_split_admits_oversize_occurrence() {
        let original = ObjectUpdate {
            region_data: ObjectUpdateRegionData::default(),
            object_data: vec![object_block(1, 200), object_block(2, 0)],
        };

        let fragments = original.to_bytes_multiple(150).unwrap();
        assert_eq!(fragments.len(), 2);
        assert!(fragments[0].len() > 150);
        assert!(fragments[1].len() <= 150);
    }
}
