//! The typed message catalogue: one struct set per protocol message, the
//!  [`PacketType`] enumeration, and the factory that reconstructs a typed message
//!  from a wire id plus payload bytes.
//!
//! The shape of this module is the rendered output of
//!  [`crate::template::generator`] for the message template, maintained by hand
//!  since. Wire rules: little-endian integers except `IPPort`, opaque `IPAddr`,
//!  quaternions packed as X/Y/Z, variable fields carrying a 1- or 2-byte length
//!  prefix, variable-multiplicity blocks carrying a one-byte occurrence count.

mod fixed;
mod high;
mod low;
mod medium;

pub use fixed::*;
pub use high::*;
pub use low::*;
pub use medium::*;

use bytes::{Buf, BufMut};

use crate::error::{GridError, Result};
use crate::template::Frequency;

/// Globally unique identity of a message: frequency class plus the id within it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum PacketType {
    // High
    StartPingCheck,
    CompletePingCheck,
    AgentUpdate,
    LayerData,
    ObjectUpdate,
    // Medium
    ObjectUpdateCompressed,
    // Low
    TestMessage,
    UseCircuitCode,
    AgentThrottle,
    HealthMessage,
    ChatFromSimulator,
    RegionHandshake,
    RegionHandshakeReply,
    SimulatorViewerTimeMessage,
    EnableSimulator,
    DisableSimulator,
    KickUser,
    CompleteAgentMovement,
    AgentMovementComplete,
    LogoutRequest,
    LogoutReply,
    // Fixed
    PacketAck,
    OpenCircuit,
    CloseCircuit,
}

impl PacketType {
    pub fn frequency(self) -> Frequency {
        use PacketType::*;
        match self {
            StartPingCheck | CompletePingCheck | AgentUpdate | LayerData | ObjectUpdate => {
                Frequency::High
            }
            ObjectUpdateCompressed => Frequency::Medium,
            TestMessage | UseCircuitCode | AgentThrottle | HealthMessage | ChatFromSimulator
            | RegionHandshake | RegionHandshakeReply | SimulatorViewerTimeMessage
            | EnableSimulator | DisableSimulator | KickUser | CompleteAgentMovement
            | AgentMovementComplete | LogoutRequest | LogoutReply => Frequency::Low,
            PacketAck | OpenCircuit | CloseCircuit => Frequency::Fixed,
        }
    }

    pub fn id(self) -> u16 {
        use PacketType::*;
        match self {
            StartPingCheck => 1,
            CompletePingCheck => 2,
            AgentUpdate => 4,
            LayerData => 11,
            ObjectUpdate => 12,
            ObjectUpdateCompressed => 13,
            TestMessage => 1,
            UseCircuitCode => 3,
            AgentThrottle => 81,
            HealthMessage => 129,
            ChatFromSimulator => 139,
            RegionHandshake => 148,
            RegionHandshakeReply => 149,
            SimulatorViewerTimeMessage => 150,
            EnableSimulator => 151,
            DisableSimulator => 152,
            KickUser => 163,
            CompleteAgentMovement => 249,
            AgentMovementComplete => 250,
            LogoutRequest => 252,
            LogoutReply => 253,
            PacketAck => 0xFB,
            OpenCircuit => 0xFC,
            CloseCircuit => 0xFD,
        }
    }

    pub fn from_id(frequency: Frequency, id: u16) -> Option<PacketType> {
        use PacketType::*;
        match (frequency, id) {
            (Frequency::High, 1) => Some(StartPingCheck),
            (Frequency::High, 2) => Some(CompletePingCheck),
            (Frequency::High, 4) => Some(AgentUpdate),
            (Frequency::High, 11) => Some(LayerData),
            (Frequency::High, 12) => Some(ObjectUpdate),
            (Frequency::Medium, 13) => Some(ObjectUpdateCompressed),
            (Frequency::Low, 1) => Some(TestMessage),
            (Frequency::Low, 3) => Some(UseCircuitCode),
            (Frequency::Low, 81) => Some(AgentThrottle),
            (Frequency::Low, 129) => Some(HealthMessage),
            (Frequency::Low, 139) => Some(ChatFromSimulator),
            (Frequency::Low, 148) => Some(RegionHandshake),
            (Frequency::Low, 149) => Some(RegionHandshakeReply),
            (Frequency::Low, 150) => Some(SimulatorViewerTimeMessage),
            (Frequency::Low, 151) => Some(EnableSimulator),
            (Frequency::Low, 152) => Some(DisableSimulator),
            (Frequency::Low, 163) => Some(KickUser),
            (Frequency::Low, 249) => Some(CompleteAgentMovement),
            (Frequency::Low, 250) => Some(AgentMovementComplete),
            (Frequency::Low, 252) => Some(LogoutRequest),
            (Frequency::Low, 253) => Some(LogoutReply),
            (Frequency::Fixed, 0xFB) => Some(PacketAck),
            (Frequency::Fixed, 0xFC) => Some(OpenCircuit),
            (Frequency::Fixed, 0xFD) => Some(CloseCircuit),
            _ => None,
        }
    }

    /// frequency class in the upper nibble, id in the lower 16 bits
    pub fn tag(self) -> u32 {
        let class = match self.frequency() {
            Frequency::High => 1u32,
            Frequency::Medium => 2,
            Frequency::Low => 3,
            Frequency::Fixed => 4,
        };
        class << 28 | self.id() as u32
    }

    /// Read a message id off the wire. High ids are one byte; a leading 0xFF
    ///  escapes to Medium, 0xFF 0xFF to Low (16-bit big-endian id), and
    ///  0xFF 0xFF 0xFF to Fixed.
    pub fn read_id(buf: &mut &[u8]) -> Result<PacketType> {
        let b0 = buf.try_get_u8()?;
        let (frequency, id) = if b0 != 0xFF {
            (Frequency::High, b0 as u16)
        } else {
            let b1 = buf.try_get_u8()?;
            if b1 != 0xFF {
                (Frequency::Medium, b1 as u16)
            } else {
                let b2 = buf.try_get_u8()?;
                let b3 = buf.try_get_u8()?;
                if b2 != 0xFF {
                    (Frequency::Low, (b2 as u16) << 8 | b3 as u16)
                } else {
                    (Frequency::Fixed, b3 as u16)
                }
            }
        };

        PacketType::from_id(frequency, id).ok_or_else(|| {
            GridError::Malformed(format!("unknown {:?}-frequency message id {}", frequency, id))
        })
    }

    pub fn write_id(self, buf: &mut Vec<u8>) {
        let id = self.id();
        match self.frequency() {
            Frequency::High => buf.put_u8(id as u8),
            Frequency::Medium => {
                buf.put_u8(0xFF);
                buf.put_u8(id as u8);
            }
            Frequency::Low => {
                buf.put_u8(0xFF);
                buf.put_u8(0xFF);
                buf.put_u16(id);
            }
            Frequency::Fixed => {
                buf.put_u8(0xFF);
                buf.put_u8(0xFF);
                buf.put_u8(0xFF);
                buf.put_u8(id as u8);
            }
        }
    }

    /// `true` if the message template marks this message zerocoded by default
    pub fn zerocoded(self) -> bool {
        use PacketType::*;
        matches!(
            self,
            AgentUpdate
                | ObjectUpdate
                | ObjectUpdateCompressed
                | TestMessage
                | AgentThrottle
                | HealthMessage
                | RegionHandshake
                | RegionHandshakeReply
        )
    }
}

/// Common surface of every catalogue message.
pub trait Packet: Sized {
    const TYPE: PacketType;

    /// body length in bytes, excluding header and message id
    fn length(&self) -> usize;

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()>;

    fn read_body(buf: &mut &[u8]) -> Result<Self>;

    fn packet_type(&self) -> PacketType {
        Self::TYPE
    }

    /// serialize the body in declaration order
    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.length());
        self.write_body(&mut buf)?;
        debug_assert_eq!(buf.len(), self.length());
        Ok(buf)
    }

    /// Serialize into one or more bodies, each no longer than `budget` bytes where
    ///  the message structure permits. Messages with a variable-multiplicity block
    ///  partition its occurrences greedily; everything else is duplicated verbatim
    ///  into every fragment. A single occurrence larger than the budget is admitted
    ///  oversize rather than looping forever.
    fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        let _ = budget;
        Ok(vec![self.to_bytes()?])
    }
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    StartPingCheck(StartPingCheck),
    CompletePingCheck(CompletePingCheck),
    AgentUpdate(AgentUpdate),
    LayerData(LayerData),
    ObjectUpdate(ObjectUpdate),
    ObjectUpdateCompressed(ObjectUpdateCompressed),
    TestMessage(TestMessage),
    UseCircuitCode(UseCircuitCode),
    AgentThrottle(AgentThrottle),
    HealthMessage(HealthMessage),
    ChatFromSimulator(ChatFromSimulator),
    RegionHandshake(RegionHandshake),
    RegionHandshakeReply(RegionHandshakeReply),
    SimulatorViewerTimeMessage(SimulatorViewerTimeMessage),
    EnableSimulator(EnableSimulator),
    DisableSimulator(DisableSimulator),
    KickUser(KickUser),
    CompleteAgentMovement(CompleteAgentMovement),
    AgentMovementComplete(AgentMovementComplete),
    LogoutRequest(LogoutRequest),
    LogoutReply(LogoutReply),
    PacketAck(PacketAck),
    OpenCircuit(OpenCircuit),
    CloseCircuit(CloseCircuit),
}

impl Message {
    /// The factory: reconstruct a typed message from its type tag and body bytes.
    ///  Trailing bytes after the body are tolerated (a resent datagram may carry
    ///  padding); a body that ends early is malformed.
    pub fn read(packet_type: PacketType, mut payload: &[u8]) -> Result<Message> {
        let buf = &mut payload;
        Ok(match packet_type {
            PacketType::StartPingCheck => Message::StartPingCheck(StartPingCheck::read_body(buf)?),
            PacketType::CompletePingCheck => {
                Message::CompletePingCheck(CompletePingCheck::read_body(buf)?)
            }
            PacketType::AgentUpdate => Message::AgentUpdate(AgentUpdate::read_body(buf)?),
            PacketType::LayerData => Message::LayerData(LayerData::read_body(buf)?),
            PacketType::ObjectUpdate => Message::ObjectUpdate(ObjectUpdate::read_body(buf)?),
            PacketType::ObjectUpdateCompressed => {
                Message::ObjectUpdateCompressed(ObjectUpdateCompressed::read_body(buf)?)
            }
            PacketType::TestMessage => Message::TestMessage(TestMessage::read_body(buf)?),
            PacketType::UseCircuitCode => Message::UseCircuitCode(UseCircuitCode::read_body(buf)?),
            PacketType::AgentThrottle => Message::AgentThrottle(AgentThrottle::read_body(buf)?),
            PacketType::HealthMessage => Message::HealthMessage(HealthMessage::read_body(buf)?),
            PacketType::ChatFromSimulator => {
                Message::ChatFromSimulator(ChatFromSimulator::read_body(buf)?)
            }
            PacketType::RegionHandshake => {
                Message::RegionHandshake(RegionHandshake::read_body(buf)?)
            }
            PacketType::RegionHandshakeReply => {
                Message::RegionHandshakeReply(RegionHandshakeReply::read_body(buf)?)
            }
            PacketType::SimulatorViewerTimeMessage => {
                Message::SimulatorViewerTimeMessage(SimulatorViewerTimeMessage::read_body(buf)?)
            }
            PacketType::EnableSimulator => {
                Message::EnableSimulator(EnableSimulator::read_body(buf)?)
            }
            PacketType::DisableSimulator => {
                Message::DisableSimulator(DisableSimulator::read_body(buf)?)
            }
            PacketType::KickUser => Message::KickUser(KickUser::read_body(buf)?),
            PacketType::CompleteAgentMovement => {
                Message::CompleteAgentMovement(CompleteAgentMovement::read_body(buf)?)
            }
            PacketType::AgentMovementComplete => {
                Message::AgentMovementComplete(AgentMovementComplete::read_body(buf)?)
            }
            PacketType::LogoutRequest => Message::LogoutRequest(LogoutRequest::read_body(buf)?),
            PacketType::LogoutReply => Message::LogoutReply(LogoutReply::read_body(buf)?),
            PacketType::PacketAck => Message::PacketAck(PacketAck::read_body(buf)?),
            PacketType::OpenCircuit => Message::OpenCircuit(OpenCircuit::read_body(buf)?),
            PacketType::CloseCircuit => Message::CloseCircuit(CloseCircuit::read_body(buf)?),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        match self {
            Message::StartPingCheck(_) => PacketType::StartPingCheck,
            Message::CompletePingCheck(_) => PacketType::CompletePingCheck,
            Message::AgentUpdate(_) => PacketType::AgentUpdate,
            Message::LayerData(_) => PacketType::LayerData,
            Message::ObjectUpdate(_) => PacketType::ObjectUpdate,
            Message::ObjectUpdateCompressed(_) => PacketType::ObjectUpdateCompressed,
            Message::TestMessage(_) => PacketType::TestMessage,
            Message::UseCircuitCode(_) => PacketType::UseCircuitCode,
            Message::AgentThrottle(_) => PacketType::AgentThrottle,
            Message::HealthMessage(_) => PacketType::HealthMessage,
            Message::ChatFromSimulator(_) => PacketType::ChatFromSimulator,
            Message::RegionHandshake(_) => PacketType::RegionHandshake,
            Message::RegionHandshakeReply(_) => PacketType::RegionHandshakeReply,
            Message::SimulatorViewerTimeMessage(_) => PacketType::SimulatorViewerTimeMessage,
            Message::EnableSimulator(_) => PacketType::EnableSimulator,
            Message::DisableSimulator(_) => PacketType::DisableSimulator,
            Message::KickUser(_) => PacketType::KickUser,
            Message::CompleteAgentMovement(_) => PacketType::CompleteAgentMovement,
            Message::AgentMovementComplete(_) => PacketType::AgentMovementComplete,
            Message::LogoutRequest(_) => PacketType::LogoutRequest,
            Message::LogoutReply(_) => PacketType::LogoutReply,
            Message::PacketAck(_) => PacketType::PacketAck,
            Message::OpenCircuit(_) => PacketType::OpenCircuit,
            Message::CloseCircuit(_) => PacketType::CloseCircuit,
        }
    }

    pub fn length(&self) -> usize {
        match self {
            Message::StartPingCheck(m) => m.length(),
            Message::CompletePingCheck(m) => m.length(),
            Message::AgentUpdate(m) => m.length(),
            Message::LayerData(m) => m.length(),
            Message::ObjectUpdate(m) => m.length(),
            Message::ObjectUpdateCompressed(m) => m.length(),
            Message::TestMessage(m) => m.length(),
            Message::UseCircuitCode(m) => m.length(),
            Message::AgentThrottle(m) => m.length(),
            Message::HealthMessage(m) => m.length(),
            Message::ChatFromSimulator(m) => m.length(),
            Message::RegionHandshake(m) => m.length(),
            Message::RegionHandshakeReply(m) => m.length(),
            Message::SimulatorViewerTimeMessage(m) => m.length(),
            Message::EnableSimulator(m) => m.length(),
            Message::DisableSimulator(m) => m.length(),
            Message::KickUser(m) => m.length(),
            Message::CompleteAgentMovement(m) => m.length(),
            Message::AgentMovementComplete(m) => m.length(),
            Message::LogoutRequest(m) => m.length(),
            Message::LogoutReply(m) => m.length(),
            Message::PacketAck(m) => m.length(),
            Message::OpenCircuit(m) => m.length(),
            Message::CloseCircuit(m) => m.length(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        match self {
            Message::StartPingCheck(m) => m.to_bytes(),
            Message::CompletePingCheck(m) => m.to_bytes(),
            Message::AgentUpdate(m) => m.to_bytes(),
            Message::LayerData(m) => m.to_bytes(),
            Message::ObjectUpdate(m) => m.to_bytes(),
            Message::ObjectUpdateCompressed(m) => m.to_bytes(),
            Message::TestMessage(m) => m.to_bytes(),
            Message::UseCircuitCode(m) => m.to_bytes(),
            Message::AgentThrottle(m) => m.to_bytes(),
            Message::HealthMessage(m) => m.to_bytes(),
            Message::ChatFromSimulator(m) => m.to_bytes(),
            Message::RegionHandshake(m) => m.to_bytes(),
            Message::RegionHandshakeReply(m) => m.to_bytes(),
            Message::SimulatorViewerTimeMessage(m) => m.to_bytes(),
            Message::EnableSimulator(m) => m.to_bytes(),
            Message::DisableSimulator(m) => m.to_bytes(),
            Message::KickUser(m) => m.to_bytes(),
            Message::CompleteAgentMovement(m) => m.to_bytes(),
            Message::AgentMovementComplete(m) => m.to_bytes(),
            Message::LogoutRequest(m) => m.to_bytes(),
            Message::LogoutReply(m) => m.to_bytes(),
            Message::PacketAck(m) => m.to_bytes(),
            Message::OpenCircuit(m) => m.to_bytes(),
            Message::CloseCircuit(m) => m.to_bytes(),
        }
    }

    pub fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        match self {
            Message::ObjectUpdate(m) => m.to_bytes_multiple(budget),
            Message::ObjectUpdateCompressed(m) => m.to_bytes_multiple(budget),
            Message::PacketAck(m) => m.to_bytes_multiple(budget),
            Message::LogoutReply(m) => m.to_bytes_multiple(budget),
            other => Ok(vec![other.to_bytes()?]),
        }
    }
}

// -- helpers shared by the per-frequency catalogue files ------------------------

/// one-byte occurrence count of a variable-multiplicity block
pub(crate) fn put_block_count(buf: &mut Vec<u8>, block: &'static str, count: usize) -> Result<()> {
    if count > u8::MAX as usize {
        return Err(GridError::CapacityExceeded {
            field: block,
            len: count,
            max: u8::MAX as usize,
        });
    }
    buf.put_u8(count as u8);
    Ok(())
}

pub(crate) fn read_blocks<T>(
    buf: &mut &[u8],
    mut read_one: impl FnMut(&mut &[u8]) -> Result<T>,
) -> Result<Vec<T>> {
    let count = buf.try_get_u8()? as usize;
    let mut blocks = Vec::with_capacity(count);
    for _ in 0..count {
        blocks.push(read_one(buf)?);
    }
    Ok(blocks)
}

pub(crate) fn read_array<T, const N: usize>(
    buf: &mut &[u8],
    mut read_one: impl FnMut(&mut &[u8]) -> Result<T>,
) -> Result<[T; N]> {
    let mut items = Vec::with_capacity(N);
    for _ in 0..N {
        items.push(read_one(buf)?);
    }
    items
        .try_into()
        .map_err(|_| GridError::malformed("block array count mismatch"))
}

/// Greedy partition of a variable block's occurrences: each fragment carries the
///  fixed message prelude (`fixed_len` bytes, including the count byte) plus as
///  many occurrences as fit in `budget`. At least one occurrence goes into every
///  fragment even if it alone exceeds the budget.
pub(crate) fn split_occurrences<T: Clone>(
    occurrences: &[T],
    fixed_len: usize,
    budget: usize,
    occurrence_len: impl Fn(&T) -> usize,
) -> Vec<Vec<T>> {
    let mut fragments = Vec::new();
    let mut current: Vec<T> = Vec::new();
    let mut current_len = fixed_len;

    for occurrence in occurrences {
        let len = occurrence_len(occurrence);
        if !current.is_empty() && current_len + len > budget {
            fragments.push(std::mem::take(&mut current));
            current_len = fixed_len;
        }
        current.push(occurrence.clone());
        current_len += len;
    }
    if !current.is_empty() || fragments.is_empty() {
        fragments.push(current);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::high(PacketType::StartPingCheck, vec![1])]
    #[case::medium(PacketType::ObjectUpdateCompressed, vec![0xFF, 13])]
    #[case::low(PacketType::UseCircuitCode, vec![0xFF, 0xFF, 0, 3])]
    #[case::low_high_id(PacketType::LogoutReply, vec![0xFF, 0xFF, 0, 253])]
    #[case::fixed(PacketType::PacketAck, vec![0xFF, 0xFF, 0xFF, 0xFB])]
    fn test_wire_id_roundtrip(#[case] packet_type: PacketType, #[case] expected: Vec<u8>) {
        let mut buf = Vec::new();
        packet_type.write_id(&mut buf);
        assert_eq!(buf, expected);
        assert_eq!(buf.len(), packet_type.frequency().id_bytes());

        assert_eq!(PacketType::read_id(&mut buf.as_slice()).unwrap(), packet_type);
    }

    #[test]
    fn test_read_id_unknown() {
        // High 200 is not in the catalogue
        assert!(PacketType::read_id(&mut [200u8].as_slice()).is_err());
    }

    #[test]
    fn test_read_id_truncated() {
        assert!(PacketType::read_id(&mut [0xFFu8, 0xFF].as_slice()).is_err());
    }

    #[test]
    fn test_tags_are_globally_unique() {
        let all = [
            PacketType::StartPingCheck,
            PacketType::TestMessage,
            PacketType::ObjectUpdate,
            PacketType::ObjectUpdateCompressed,
            PacketType::PacketAck,
            PacketType::LogoutReply,
        ];
        let mut tags: Vec<u32> = all.iter().map(|t| t.tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), all.len());

        // TestMessage (Low 1) and StartPingCheck (High 1) share an id but not a tag
        assert_ne!(PacketType::TestMessage.tag(), PacketType::StartPingCheck.tag());
    }

    #[rstest]
    #[case::fits_one(4, 10, vec![vec![3, 3]])]
    #[case::two_each(4, 7, vec![vec![3], vec![3]])]
    #[case::oversize_admitted(4, 5, vec![vec![3], vec![3]])]
    fn test_split_occurrences(#[case] fixed_len: usize, #[case] budget: usize, #[case] expected: Vec<Vec<usize>>) {
        let occurrences = vec![3usize, 3];
        let split = split_occurrences(&occurrences, fixed_len, budget, |&len| len);
        assert_eq!(split, expected);
    }

    #[test]
    fn test_split_occurrences_empty_yields_single_fragment() {
        let split = split_occurrences(&[] as &[usize], 4, 10, |&len| len);
        assert_eq!(split, vec![Vec::<usize>::new()]);
    }

    #[test]
    fn test_split_occurrences_oversize_single() {
        let split = split_occurrences(&[100usize, 2], 4, 10, |&len| len);
        assert_eq!(split, vec![vec![100], vec![2]]);
    }
}
