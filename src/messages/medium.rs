//! Medium-frequency messages (two-byte wire id).

use bytes::{Buf, BufMut};

use crate::error::Result;
use crate::messages::{put_block_count, read_blocks, split_occurrences, Packet, PacketType};
use crate::wire::codec::{WireReadExt, WireWriteExt};

/// Compressed object state; each occurrence carries an opaque compressed blob.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdateCompressedRegionData {
    pub region_handle: u64,
    pub time_dilation: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdateCompressedObjectData {
    pub update_flags: u32,
    pub data: Vec<u8>,
}

impl ObjectUpdateCompressedObjectData {
    fn wire_len(&self) -> usize {
        4 + 2 + self.data.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectUpdateCompressed {
    pub region_data: ObjectUpdateCompressedRegionData,
    pub object_data: Vec<ObjectUpdateCompressedObjectData>,
}

impl ObjectUpdateCompressed {
    const FIXED_LEN: usize = 8 + 2 + 1;
}

impl Packet for ObjectUpdateCompressed {
    const TYPE: PacketType = PacketType::ObjectUpdateCompressed;

    fn length(&self) -> usize {
        Self::FIXED_LEN + self.object_data.iter().map(|b| b.wire_len()).sum::<usize>()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u64_le(self.region_data.region_handle);
        buf.put_u16_le(self.region_data.time_dilation);
        put_block_count(buf, "ObjectUpdateCompressed.ObjectData", self.object_data.len())?;
        for block in &self.object_data {
            buf.put_u32_le(block.update_flags);
            buf.put_variable2("ObjectUpdateCompressed.Data", &block.data)?;
        }
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<ObjectUpdateCompressed> {
        Ok(ObjectUpdateCompressed {
            region_data: ObjectUpdateCompressedRegionData {
                region_handle: buf.try_get_u64_le()?,
                time_dilation: buf.try_get_u16_le()?,
            },
            object_data: read_blocks(buf, |buf| {
                Ok(ObjectUpdateCompressedObjectData {
                    update_flags: buf.try_get_u32_le()?,
                    data: buf.try_variable2()?,
                })
            })?,
        })
    }

    fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        if self.length() <= budget {
            return Ok(vec![self.to_bytes()?]);
        }

        split_occurrences(&self.object_data, Self::FIXED_LEN, budget, |b| b.wire_len())
            .into_iter()
            .map(|object_data| {
                ObjectUpdateCompressed {
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
    use super::*;

    fn sample(blob_lens: &[usize]) -> ObjectUpdateCompressed {
        ObjectUpdateCompressed {
            region_data: ObjectUpdateCompressedRegionData {
                region_handle: 123456789,
                time_dilation: 30000,
            },
            object_data: blob_lens
                .iter()
                .enumerate()
                .map(|(i, &len)| ObjectUpdateCompressedObjectData {
                    update_flags: i as u32,
                    data: vec![i as u8; len],
                })
                .collect(),
        }
    }

    #[test]
    fn test_roundtrip_and_length_law() {
        let message = sample(&[0, 17, 300]);
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.length());
        assert_eq!(
            ObjectUpdateCompressed::read_body(&mut bytes.as_slice()).unwrap(),
            message
        );
    }

    #[test]
    fn test_split_reassembles() {
        let message = sample(&[200, 200, 200, 200, 200]);
        let fragments = message.to_bytes_multiple(500).unwrap();
        assert!(fragments.len() >= 3);

        let mut reassembled = Vec::new();
        for fragment in &fragments {
            assert!(fragment.len() <= 500);
            let decoded = ObjectUpdateCompressed::read_body(&mut fragment.as_slice()).unwrap();
            assert_eq!(decoded.region_data, message.region_data);
            reassembled.extend(decoded.object_data);
        }
        assert_eq!(reassembled, message.object_data);
    }
}
