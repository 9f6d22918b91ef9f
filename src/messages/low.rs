//! Low-frequency messages (four-byte wire id): circuit lifecycle, handshake,
//!  throttling, chat and the odd diagnostic.

use bytes::{Buf, BufMut};
use uuid::Uuid;

use crate::error::Result;
use crate::messages::{put_block_count, read_array, read_blocks, split_occurrences, Packet, PacketType};
use crate::types::Vector3;
use crate::wire::codec::{WireReadExt, WireWriteExt};

/// The venerable wire-format self-test message, kept for its `Multiple` block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestMessageTestBlock1 {
    pub test1: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestMessageNeighborBlock {
    pub test0: u32,
    pub test1: u32,
    pub test2: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TestMessage {
    pub test_block1: TestMessageTestBlock1,
    pub neighbor_block: [TestMessageNeighborBlock; 4],
}

impl Packet for TestMessage {
    const TYPE: PacketType = PacketType::TestMessage;

    fn length(&self) -> usize {
        4 + 4 * 12
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32_le(self.test_block1.test1);
        for block in &self.neighbor_block {
            buf.put_u32_le(block.test0);
            buf.put_u32_le(block.test1);
            buf.put_u32_le(block.test2);
        }
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<TestMessage> {
        Ok(TestMessage {
            test_block1: TestMessageTestBlock1 {
                test1: buf.try_get_u32_le()?,
            },
            neighbor_block: read_array::<_, 4>(buf, |buf| {
                Ok(TestMessageNeighborBlock {
                    test0: buf.try_get_u32_le()?,
                    test1: buf.try_get_u32_le()?,
                    test2: buf.try_get_u32_le()?,
                })
            })?,
        })
    }
}

/// First packet on a fresh circuit: binds the UDP endpoint to a circuit code
///  handed out at login.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UseCircuitCodeCircuitCode {
    pub code: u32,
    pub session_id: Uuid,
    /// the agent id
    pub id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UseCircuitCode {
    pub circuit_code: UseCircuitCodeCircuitCode,
}

impl Packet for UseCircuitCode {
    const TYPE: PacketType = PacketType::UseCircuitCode;

    fn length(&self) -> usize {
        36
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u32_le(self.circuit_code.code);
        buf.put_uuid(&self.circuit_code.session_id);
        buf.put_uuid(&self.circuit_code.id);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<UseCircuitCode> {
        Ok(UseCircuitCode {
            circuit_code: UseCircuitCodeCircuitCode {
                code: buf.try_get_u32_le()?,
                session_id: buf.try_uuid()?,
                id: buf.try_uuid()?,
            },
        })
    }
}

/// Advertises the seven-channel bandwidth schedule to the simulator. The
///  `throttles` blob is the 28-byte little-endian f32 vector produced by
///  [`crate::circuit::ThrottleRates::to_bytes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentThrottleAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentThrottleThrottle {
    pub gen_counter: u32,
    pub throttles: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentThrottle {
    pub agent_data: AgentThrottleAgentData,
    pub throttle: AgentThrottleThrottle,
}

impl Packet for AgentThrottle {
    const TYPE: PacketType = PacketType::AgentThrottle;

    fn length(&self) -> usize {
        36 + 4 + 1 + self.throttle.throttles.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        buf.put_u32_le(self.agent_data.circuit_code);
        buf.put_u32_le(self.throttle.gen_counter);
        buf.put_variable1("AgentThrottle.Throttles", &self.throttle.throttles)?;
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<AgentThrottle> {
        Ok(AgentThrottle {
            agent_data: AgentThrottleAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
                circuit_code: buf.try_get_u32_le()?,
            },
            throttle: AgentThrottleThrottle {
                gen_counter: buf.try_get_u32_le()?,
                throttles: buf.try_variable1()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthMessageHealthData {
    pub health: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthMessage {
    pub health_data: HealthMessageHealthData,
}

impl Packet for HealthMessage {
    const TYPE: PacketType = PacketType::HealthMessage;

    fn length(&self) -> usize {
        4
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_f32_le(self.health_data.health);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<HealthMessage> {
        Ok(HealthMessage {
            health_data: HealthMessageHealthData {
                health: buf.try_get_f32_le()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatFromSimulatorChatData {
    pub from_name: Vec<u8>,
    pub source_id: Uuid,
    pub owner_id: Uuid,
    pub source_type: u8,
    pub chat_type: u8,
    pub audible: u8,
    pub position: Vector3,
    pub message: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatFromSimulator {
    pub chat_data: ChatFromSimulatorChatData,
}

impl Packet for ChatFromSimulator {
    const TYPE: PacketType = PacketType::ChatFromSimulator;

    fn length(&self) -> usize {
        let data = &self.chat_data;
        1 + data.from_name.len() + 16 + 16 + 1 + 1 + 1 + 12 + 2 + data.message.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        let data = &self.chat_data;
        buf.put_variable1("ChatFromSimulator.FromName", &data.from_name)?;
        buf.put_uuid(&data.source_id);
        buf.put_uuid(&data.owner_id);
        buf.put_u8(data.source_type);
        buf.put_u8(data.chat_type);
        buf.put_u8(data.audible);
        buf.put_vector3(&data.position);
        buf.put_variable2("ChatFromSimulator.Message", &data.message)?;
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<ChatFromSimulator> {
        Ok(ChatFromSimulator {
            chat_data: ChatFromSimulatorChatData {
                from_name: buf.try_variable1()?,
                source_id: buf.try_uuid()?,
                owner_id: buf.try_uuid()?,
                source_type: buf.try_get_u8()?,
                chat_type: buf.try_get_u8()?,
                audible: buf.try_get_u8()?,
                position: buf.try_vector3()?,
                message: buf.try_variable2()?,
            },
        })
    }
}

/// Sent by the simulator once [`UseCircuitCode`] lands; answering with
///  [`RegionHandshakeReply`] completes the handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHandshakeRegionInfo {
    pub region_flags: u32,
    pub sim_access: u8,
    pub sim_name: Vec<u8>,
    pub sim_owner: Uuid,
    pub is_estate_manager: bool,
    pub water_height: f32,
    pub region_id: Uuid,
    pub cache_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHandshake {
    pub region_info: RegionHandshakeRegionInfo,
}

impl Packet for RegionHandshake {
    const TYPE: PacketType = PacketType::RegionHandshake;

    fn length(&self) -> usize {
        4 + 1 + 1 + self.region_info.sim_name.len() + 16 + 1 + 4 + 16 + 16
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        let info = &self.region_info;
        buf.put_u32_le(info.region_flags);
        buf.put_u8(info.sim_access);
        buf.put_variable1("RegionHandshake.SimName", &info.sim_name)?;
        buf.put_uuid(&info.sim_owner);
        buf.put_u8(info.is_estate_manager as u8);
        buf.put_f32_le(info.water_height);
        buf.put_uuid(&info.region_id);
        buf.put_uuid(&info.cache_id);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<RegionHandshake> {
        Ok(RegionHandshake {
            region_info: RegionHandshakeRegionInfo {
                region_flags: buf.try_get_u32_le()?,
                sim_access: buf.try_get_u8()?,
                sim_name: buf.try_variable1()?,
                sim_owner: buf.try_uuid()?,
                is_estate_manager: buf.try_get_u8()? != 0,
                water_height: buf.try_get_f32_le()?,
                region_id: buf.try_uuid()?,
                cache_id: buf.try_uuid()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHandshakeReplyAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHandshakeReplyRegionInfo {
    pub flags: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegionHandshakeReply {
    pub agent_data: RegionHandshakeReplyAgentData,
    pub region_info: RegionHandshakeReplyRegionInfo,
}

impl Packet for RegionHandshakeReply {
    const TYPE: PacketType = PacketType::RegionHandshakeReply;

    fn length(&self) -> usize {
        32 + 4
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        buf.put_u32_le(self.region_info.flags);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<RegionHandshakeReply> {
        Ok(RegionHandshakeReply {
            agent_data: RegionHandshakeReplyAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
            },
            region_info: RegionHandshakeReplyRegionInfo {
                flags: buf.try_get_u32_le()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorViewerTimeMessageTimeInfo {
    pub usec_since_start: u64,
    pub sec_per_day: u32,
    pub sec_per_year: u32,
    pub sun_direction: Vector3,
    pub sun_phase: f32,
    pub sun_angular_velocity: Vector3,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimulatorViewerTimeMessage {
    pub time_info: SimulatorViewerTimeMessageTimeInfo,
}

impl Packet for SimulatorViewerTimeMessage {
    const TYPE: PacketType = PacketType::SimulatorViewerTimeMessage;

    fn length(&self) -> usize {
        8 + 4 + 4 + 12 + 4 + 12
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        let info = &self.time_info;
        buf.put_u64_le(info.usec_since_start);
        buf.put_u32_le(info.sec_per_day);
        buf.put_u32_le(info.sec_per_year);
        buf.put_vector3(&info.sun_direction);
        buf.put_f32_le(info.sun_phase);
        buf.put_vector3(&info.sun_angular_velocity);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<SimulatorViewerTimeMessage> {
        Ok(SimulatorViewerTimeMessage {
            time_info: SimulatorViewerTimeMessageTimeInfo {
                usec_since_start: buf.try_get_u64_le()?,
                sec_per_day: buf.try_get_u32_le()?,
                sec_per_year: buf.try_get_u32_le()?,
                sun_direction: buf.try_vector3()?,
                sun_phase: buf.try_get_f32_le()?,
                sun_angular_velocity: buf.try_vector3()?,
            },
        })
    }
}

/// Announces a neighbouring simulator; the engine opens a handshaking circuit to
///  the endpoint when `multiple_sims` is enabled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnableSimulatorSimulatorInfo {
    pub handle: u64,
    pub ip: [u8; 4],
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnableSimulator {
    pub simulator_info: EnableSimulatorSimulatorInfo,
}

impl Packet for EnableSimulator {
    const TYPE: PacketType = PacketType::EnableSimulator;

    fn length(&self) -> usize {
        8 + 4 + 2
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_u64_le(self.simulator_info.handle);
        buf.put_ip_addr(&self.simulator_info.ip);
        buf.put_ip_port(self.simulator_info.port);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<EnableSimulator> {
        Ok(EnableSimulator {
            simulator_info: EnableSimulatorSimulatorInfo {
                handle: buf.try_get_u64_le()?,
                ip: buf.try_ip_addr()?,
                port: buf.try_ip_port()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisableSimulator;

impl Packet for DisableSimulator {
    const TYPE: PacketType = PacketType::DisableSimulator;

    fn length(&self) -> usize {
        0
    }

    fn write_body(&self, _buf: &mut Vec<u8>) -> Result<()> {
        Ok(())
    }

    fn read_body(_buf: &mut &[u8]) -> Result<DisableSimulator> {
        Ok(DisableSimulator)
    }
}

/// Server-initiated eviction; the circuit is torn down after dispatch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KickUserTargetBlock {
    pub target_ip: [u8; 4],
    pub target_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KickUserUserInfo {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub reason: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KickUser {
    pub target_block: KickUserTargetBlock,
    pub user_info: KickUserUserInfo,
}

impl Packet for KickUser {
    const TYPE: PacketType = PacketType::KickUser;

    fn length(&self) -> usize {
        4 + 2 + 16 + 16 + 2 + self.user_info.reason.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_ip_addr(&self.target_block.target_ip);
        buf.put_ip_port(self.target_block.target_port);
        buf.put_uuid(&self.user_info.agent_id);
        buf.put_uuid(&self.user_info.session_id);
        buf.put_variable2("KickUser.Reason", &self.user_info.reason)?;
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<KickUser> {
        Ok(KickUser {
            target_block: KickUserTargetBlock {
                target_ip: buf.try_ip_addr()?,
                target_port: buf.try_ip_port()?,
            },
            user_info: KickUserUserInfo {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
                reason: buf.try_variable2()?,
            },
        })
    }
}

/// Finalizes avatar placement on the (default) circuit after the handshake.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompleteAgentMovementAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
    pub circuit_code: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompleteAgentMovement {
    pub agent_data: CompleteAgentMovementAgentData,
}

impl Packet for CompleteAgentMovement {
    const TYPE: PacketType = PacketType::CompleteAgentMovement;

    fn length(&self) -> usize {
        36
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        buf.put_u32_le(self.agent_data.circuit_code);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<CompleteAgentMovement> {
        Ok(CompleteAgentMovement {
            agent_data: CompleteAgentMovementAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
                circuit_code: buf.try_get_u32_le()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMovementCompleteAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMovementCompleteData {
    pub position: Vector3,
    pub look_at: Vector3,
    pub region_handle: u64,
    pub timestamp: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentMovementComplete {
    pub agent_data: AgentMovementCompleteAgentData,
    pub data: AgentMovementCompleteData,
}

impl Packet for AgentMovementComplete {
    const TYPE: PacketType = PacketType::AgentMovementComplete;

    fn length(&self) -> usize {
        32 + 12 + 12 + 8 + 4
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        buf.put_vector3(&self.data.position);
        buf.put_vector3(&self.data.look_at);
        buf.put_u64_le(self.data.region_handle);
        buf.put_u32_le(self.data.timestamp);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<AgentMovementComplete> {
        Ok(AgentMovementComplete {
            agent_data: AgentMovementCompleteAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
            },
            data: AgentMovementCompleteData {
                position: buf.try_vector3()?,
                look_at: buf.try_vector3()?,
                region_handle: buf.try_get_u64_le()?,
                timestamp: buf.try_get_u32_le()?,
            },
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutRequestAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutRequest {
    pub agent_data: LogoutRequestAgentData,
}

impl Packet for LogoutRequest {
    const TYPE: PacketType = PacketType::LogoutRequest;

    fn length(&self) -> usize {
        32
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<LogoutRequest> {
        Ok(LogoutRequest {
            agent_data: LogoutRequestAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
            },
        })
    }
}

/// Confirms the logout and lists inventory items that changed during the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutReplyAgentData {
    pub agent_id: Uuid,
    pub session_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutReplyInventoryData {
    pub item_id: Uuid,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutReply {
    pub agent_data: LogoutReplyAgentData,
    pub inventory_data: Vec<LogoutReplyInventoryData>,
}

impl LogoutReply {
    const FIXED_LEN: usize = 32 + 1;
}

impl Packet for LogoutReply {
    const TYPE: PacketType = PacketType::LogoutReply;

    fn length(&self) -> usize {
        Self::FIXED_LEN + 16 * self.inventory_data.len()
    }

    fn write_body(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.put_uuid(&self.agent_data.agent_id);
        buf.put_uuid(&self.agent_data.session_id);
        put_block_count(buf, "LogoutReply.InventoryData", self.inventory_data.len())?;
        for block in &self.inventory_data {
            buf.put_uuid(&block.item_id);
        }
        Ok(())
    }

    fn read_body(buf: &mut &[u8]) -> Result<LogoutReply> {
        Ok(LogoutReply {
            agent_data: LogoutReplyAgentData {
                agent_id: buf.try_uuid()?,
                session_id: buf.try_uuid()?,
            },
            inventory_data: read_blocks(buf, |buf| {
                Ok(LogoutReplyInventoryData {
                    item_id: buf.try_uuid()?,
                })
            })?,
        })
    }

    fn to_bytes_multiple(&self, budget: usize) -> Result<Vec<Vec<u8>>> {
        if self.length() <= budget {
            return Ok(vec![self.to_bytes()?]);
        }

        split_occurrences(&self.inventory_data, Self::FIXED_LEN, budget, |_| 16)
            .into_iter()
            .map(|inventory_data| {
                LogoutReply {
                    agent_data: self.agent_data.clone(),
                    inventory_data,
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

    #[rstest]
    #[case::test_message(Message::TestMessage(TestMessage {
        test_block1: TestMessageTestBlock1 { test1: 9 },
        neighbor_block: [
            TestMessageNeighborBlock { test0: 1, test1: 2, test2: 3 },
            TestMessageNeighborBlock { test0: 4, test1: 5, test2: 6 },
            TestMessageNeighborBlock { test0: 7, test1: 8, test2: 9 },
            TestMessageNeighborBlock { test0: 10, test1: 11, test2: 12 },
        ],
    }))]
    #[case::use_circuit_code(Message::UseCircuitCode(UseCircuitCode {
        circuit_code: UseCircuitCodeCircuitCode {
            code: 0xDEADBEEF,
            session_id: Uuid::new_v4(),
            id: Uuid::new_v4(),
        },
    }))]
    #[case::agent_throttle(Message::AgentThrottle(AgentThrottle {
        agent_data: AgentThrottleAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            circuit_code: 1,
        },
        throttle: AgentThrottleThrottle { gen_counter: 0, throttles: vec![0; 28] },
    }))]
    #[case::health(Message::HealthMessage(HealthMessage {
        health_data: HealthMessageHealthData { health: 100.0 },
    }))]
    #[case::chat(Message::ChatFromSimulator(ChatFromSimulator {
        chat_data: ChatFromSimulatorChatData {
            from_name: b"Ruth\0".to_vec(),
            source_id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            source_type: 1,
            chat_type: 1,
            audible: 1,
            position: Vector3::new(128.0, 64.0, 22.0),
            message: b"Hello, Avatar!\0".to_vec(),
        },
    }))]
    #[case::region_handshake(Message::RegionHandshake(RegionHandshake {
        region_info: RegionHandshakeRegionInfo {
            region_flags: 0x01,
            sim_access: 13,
            sim_name: b"Ahern\0".to_vec(),
            sim_owner: Uuid::new_v4(),
            is_estate_manager: true,
            water_height: 20.0,
            region_id: Uuid::new_v4(),
            cache_id: Uuid::new_v4(),
        },
    }))]
    #[case::region_handshake_reply(Message::RegionHandshakeReply(RegionHandshakeReply {
        agent_data: RegionHandshakeReplyAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        },
        region_info: RegionHandshakeReplyRegionInfo { flags: 3 },
    }))]
    #[case::sim_time(Message::SimulatorViewerTimeMessage(SimulatorViewerTimeMessage {
        time_info: SimulatorViewerTimeMessageTimeInfo {
            usec_since_start: u64::MAX / 3,
            sec_per_day: 14400,
            sec_per_year: 5270400,
            sun_direction: Vector3::new(0.0, 0.7, 0.7),
            sun_phase: 1.5,
            sun_angular_velocity: Vector3::ZERO,
        },
    }))]
    #[case::enable_simulator(Message::EnableSimulator(EnableSimulator {
        simulator_info: EnableSimulatorSimulatorInfo {
            handle: 123,
            ip: [10, 0, 0, 1],
            port: 13001,
        },
    }))]
    #[case::disable_simulator(Message::DisableSimulator(DisableSimulator))]
    #[case::kick_user(Message::KickUser(KickUser {
        target_block: KickUserTargetBlock { target_ip: [127, 0, 0, 1], target_port: 9000 },
        user_info: KickUserUserInfo {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            reason: b"gone fishing".to_vec(),
        },
    }))]
    #[case::complete_agent_movement(Message::CompleteAgentMovement(CompleteAgentMovement {
        agent_data: CompleteAgentMovementAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            circuit_code: 77,
        },
    }))]
    #[case::agent_movement_complete(Message::AgentMovementComplete(AgentMovementComplete {
        agent_data: AgentMovementCompleteAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        },
        data: AgentMovementCompleteData {
            position: Vector3::new(1.0, 2.0, 3.0),
            look_at: Vector3::new(0.0, 1.0, 0.0),
            region_handle: 42,
            timestamp: 1_700_000_000,
        },
    }))]
    #[case::logout_request(Message::LogoutRequest(LogoutRequest {
        agent_data: LogoutRequestAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        },
    }))]
    #[case::logout_reply(Message::LogoutReply(LogoutReply {
        agent_data: LogoutReplyAgentData {
            agent_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
        },
        inventory_data: vec![
            LogoutReplyInventoryData { item_id: Uuid::new_v4() },
            LogoutReplyInventoryData { item_id: Uuid::new_v4() },
        ],
    }))]
    fn test_roundtrip_and_length_law(#[case] message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.length());

        let decoded = Message::read(message.packet_type(), &bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_enable_simulator_port_is_big_endian() {
        let message = EnableSimulator {
            simulator_info: EnableSimulatorSimulatorInfo {
                handle: 0,
                ip: [1, 2, 3, 4],
                port: 0x3039, // 12345
            },
        };
        let bytes = message.to_bytes().unwrap();
        // ip bytes appear verbatim, port is network order
        assert_eq!(&bytes[8..12], &[1, 2, 3, 4]);
        assert_eq!(&bytes[12..14], &[0x30, 0x39]);
    }

    #[test]
    fn test_logout_reply_split() {
        let original = LogoutReply {
            agent_data: LogoutReplyAgentData {
                agent_id: Uuid::new_v4(),
                session_id: Uuid::new_v4(),
            },
            inventory_data: (0..100)
                .map(|_| LogoutReplyInventoryData { item_id: Uuid::new_v4() })
                .collect(),
        };

        let fragments = original.to_bytes_multiple(200).unwrap();
        assert!(fragments.len() > 1);

        let mut reassembled = Vec::new();
        for fragment in &fragments {
            assert!(fragment.len() <= 200);
            let decoded = LogoutReply::read_body(&mut fragment.as_slice()).unwrap();
            assert_eq!(decoded.agent_data, original.agent_data);
            reassembled.extend(decoded.inventory_data);
        }
        assert_eq!(reassembled, original.inventory_data);
    }

    #[test]
    fn test_variable_field_overflow_surfaces_before_send() {
        let message = ChatFromSimulator {
            chat_data: ChatFromSimulatorChatData {
                from_name: vec![b'x'; 300],
                ..Default::default()
            },
        };
        assert!(message.to_bytes().is_err());
    }
}
