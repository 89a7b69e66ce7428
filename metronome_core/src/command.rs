//! The command record exchanged between cores, brokers, and comms layers,
//! together with the action-code and flag vocabulary of the protocol.

use serde::{Deserialize, Serialize};

use crate::{
    buffer::SmallBuffer,
    ids::{GlobalFederateId, InterfaceHandle},
    time::Time,
};

/// Command kinds. Negative codes travel the priority channel on transports
/// that expose one; the transmit queue always drains them first.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Action {
    /// Placeholder for an unset or unparseable command.
    Invalid = -1_000_000,

    // --- priority band ---
    /// Comms-level control handled inside the comms layer, priority band.
    ProtocolPriority = -60,
    /// Register a federate with the parent broker.
    RegFed = -105,
    /// Register a sub-broker or core with its parent.
    RegBroker = -110,
    /// Acknowledge a federate registration, assigning its global id.
    FedAck = -115,
    /// Acknowledge a broker/core registration, assigning its global id.
    BrokerAck = -117,
    /// Query traveling the fast path.
    Query = -125,
    /// Response to a fast query.
    QueryReply = -127,

    #[default]
    Ignore = 0,

    // --- normal band ---
    /// Comms-level control handled inside the comms layer.
    Protocol = 45,

    /// Request to enter initializing mode.
    Init = 530,
    /// Federation-wide grant of initializing mode.
    InitGrant = 532,

    TimeRequest = 500,
    TimeGrant = 504,
    TimeBlock = 508,
    TimeUnblock = 510,
    ExecRequest = 520,
    ExecGrant = 522,

    /// Published value data.
    Publish = 1000,
    /// Endpoint-addressed message data.
    SendMessage = 1010,

    RegPub = 1100,
    RegInput = 1102,
    RegEndpoint = 1104,
    RegFilter = 1106,
    RegTranslator = 1108,
    /// Connect a publication to a subscribing input.
    AddSubscriber = 1120,
    AddPublisher = 1122,
    /// Declare a source->destination endpoint link.
    AddEndpointLink = 1124,

    AddDependency = 1140,
    RemoveDependency = 1141,
    AddDependent = 1142,
    RemoveDependent = 1143,
    AddInterdependency = 1144,
    RemoveInterdependency = 1145,

    /// Timing-configuration update; `message_id` selects the property.
    TimeConfigure = 1160,

    /// Query traveling in order with data.
    OrderedQuery = 1200,
    OrderedQueryReply = 1202,

    Disconnect = 2000,
    /// Error local to one federate or core.
    Error = 2005,
    /// Federation-wide fatal error; halts all peers.
    GlobalError = 2010,
}

impl Action {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Sub-codes carried in `message_id` on `Protocol`/`ProtocolPriority`
/// commands, interpreted by the comms layer.
pub mod protocol {
    pub const NEW_ROUTE: i32 = 233;
    pub const REMOVE_ROUTE: i32 = 244;
    pub const CONNECTION_INFORMATION: i32 = 255;
    pub const CONNECTION_REQUEST: i32 = 256;
    pub const CONNECTION_ACK: i32 = 257;
    pub const NEW_BROKER_INFORMATION: i32 = 258;
    pub const DELAY_CONNECTION: i32 = 259;
    pub const NAME_NOT_FOUND: i32 = 260;
    pub const QUERY_PORTS: i32 = 271;
    pub const REQUEST_PORTS: i32 = 272;
    pub const PORT_DEFINITIONS: i32 = 273;
    pub const CLOSE_RECEIVER: i32 = 285;
    pub const DISCONNECT: i32 = 286;
    pub const DISCONNECT_ERROR: i32 = 287;
    pub const RECONNECT_TRANSMITTER: i32 = 288;
    pub const RECONNECT_RECEIVER: i32 = 289;
}

/// Property selectors carried in `message_id` on `TimeConfigure` commands.
pub mod update {
    pub const OUTPUT_DELAY: i32 = 1;
    pub const INPUT_DELAY: i32 = 2;
    pub const MIN_DELTA: i32 = 3;
    pub const PERIOD: i32 = 4;
    pub const OFFSET: i32 = 5;
    pub const MAX_ITERATIONS: i32 = 6;
    pub const LOG_LEVEL: i32 = 7;
    pub const FLAG: i32 = 8;
}

/// Flag selectors for `update::FLAG` configuration commands; the new value
/// rides on [`MessageFlags::INDICATOR`].
pub mod fed_flag {
    pub const UNINTERRUPTIBLE: i32 = 1;
    pub const ONLY_TRANSMIT_ON_CHANGE: i32 = 2;
    pub const ONLY_UPDATE_ON_CHANGE: i32 = 3;
    pub const WAIT_FOR_CURRENT_TIME_UPDATES: i32 = 4;
    pub const SOURCE_ONLY: i32 = 5;
    pub const OBSERVER: i32 = 6;
}

/// Bitset of per-message flags.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MessageFlags(pub u16);

impl MessageFlags {
    pub const ITERATION_REQUESTED: MessageFlags = MessageFlags(1 << 0);
    pub const DESTINATION_TARGET: MessageFlags = MessageFlags(1 << 1);
    pub const REQUIRED: MessageFlags = MessageFlags(1 << 2);
    pub const ERROR: MessageFlags = MessageFlags(1 << 3);
    /// Generic boolean payload for configuration commands.
    pub const INDICATOR: MessageFlags = MessageFlags(1 << 4);
    pub const USE_JSON_SERIALIZATION: MessageFlags = MessageFlags(1 << 5);
    pub const CLONE: MessageFlags = MessageFlags(1 << 6);

    pub fn contains(self, flag: MessageFlags) -> bool {
        self.0 & flag.0 != 0
    }

    pub fn set(&mut self, flag: MessageFlags) {
        self.0 |= flag.0;
    }

    pub fn clear(&mut self, flag: MessageFlags) {
        self.0 &= !flag.0;
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("binary decode failed: {0}")]
    Binary(#[from] bincode::Error),
    #[error("json decode failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized frame format tag {0}")]
    UnknownFormat(u8),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame header: 4-byte big-endian body length plus a
/// one-byte format tag.
const FRAME_HEADER_LEN: usize = 5;
const FORMAT_BINARY: u8 = 0;
const FORMAT_JSON: u8 = 1;

/// The universal command record.
#[derive(Serialize, Deserialize)]
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ActionMessage {
    pub action: Action,
    pub source_id: GlobalFederateId,
    pub dest_id: GlobalFederateId,
    pub source_handle: InterfaceHandle,
    pub dest_handle: InterfaceHandle,
    /// Protocol sub-code, property selector, or query token.
    pub message_id: i32,
    /// Iteration counter.
    pub counter: u16,
    pub flags: MessageFlags,
    pub action_time: Time,
    /// Earliest-event time.
    pub te: Time,
    /// Minimum dependent-event time.
    pub tdemin: Time,
    pub extra_data: i32,
    pub payload: SmallBuffer,
    pub string_data: Vec<String>,
    pub name: String,
}

impl ActionMessage {
    pub fn new(action: Action) -> Self {
        ActionMessage {
            action,
            source_id: GlobalFederateId::INVALID,
            dest_id: GlobalFederateId::INVALID,
            source_handle: InterfaceHandle::INVALID,
            dest_handle: InterfaceHandle::INVALID,
            action_time: Time::ZERO,
            te: Time::ZERO,
            tdemin: Time::ZERO,
            ..Default::default()
        }
    }

    /// A comms control command on the normal band.
    pub fn protocol(message_id: i32) -> Self {
        let mut cmd = ActionMessage::new(Action::Protocol);
        cmd.message_id = message_id;
        cmd
    }

    /// A comms control command on the priority band.
    pub fn protocol_priority(message_id: i32) -> Self {
        let mut cmd = ActionMessage::new(Action::ProtocolPriority);
        cmd.message_id = message_id;
        cmd
    }

    pub fn set_flag(&mut self, flag: MessageFlags) {
        self.flags.set(flag);
    }

    pub fn has_flag(&self, flag: MessageFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_protocol_command(&self) -> bool {
        matches!(self.action, Action::Protocol | Action::ProtocolPriority)
    }

    pub fn is_priority_command(&self) -> bool {
        self.action.code() < 0 && self.action != Action::Invalid
    }

    pub fn is_valid_command(&self) -> bool {
        self.action != Action::Invalid
    }

    pub fn is_disconnect_command(&self) -> bool {
        matches!(self.action, Action::Disconnect | Action::GlobalError)
            || (self.is_protocol_command()
                && matches!(
                    self.message_id,
                    protocol::DISCONNECT | protocol::DISCONNECT_ERROR | protocol::CLOSE_RECEIVER
                ))
    }

    /// Commands that may be dropped without a warning when no route exists.
    pub fn is_ignoreable_command(&self) -> bool {
        matches!(self.action, Action::Ignore | Action::Protocol | Action::ProtocolPriority)
    }

    /// Binary wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("command serialization cannot fail")
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, CommandError> {
        Ok(bincode::deserialize(data)?)
    }

    /// JSON wire form, used when [`MessageFlags::USE_JSON_SERIALIZATION`] is
    /// in force on a link.
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).expect("command serialization cannot fail")
    }

    pub fn from_json(data: &[u8]) -> Result<Self, CommandError> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Produce a self-delimiting frame for stream transports.
    pub fn packetize(&self) -> Vec<u8> {
        self.packetize_as(false)
    }

    pub fn packetize_json(&self) -> Vec<u8> {
        self.packetize_as(true)
    }

    fn packetize_as(&self, json: bool) -> Vec<u8> {
        let (tag, body) = if json {
            (FORMAT_JSON, self.to_json_string().into_bytes())
        } else {
            (FORMAT_BINARY, self.to_bytes())
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.push(tag);
        frame.extend_from_slice(&body);
        frame
    }

    /// Parse one frame from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` holds only a strict prefix of a frame
    /// (more bytes needed); `Ok(Some((message, consumed)))` on success.
    pub fn depacketize(data: &[u8]) -> Result<Option<(ActionMessage, usize)>, CommandError> {
        if data.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let total = FRAME_HEADER_LEN + body_len;
        if data.len() < total {
            return Ok(None);
        }
        let body = &data[FRAME_HEADER_LEN..total];
        let msg = match data[4] {
            FORMAT_BINARY => ActionMessage::from_bytes(body)?,
            FORMAT_JSON => ActionMessage::from_json(body)?,
            tag => return Err(CommandError::UnknownFormat(tag)),
        };
        Ok(Some((msg, total)))
    }
}

impl std::fmt::Display for ActionMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}[{} -> {}] t={}",
            self.action, self.source_id, self.dest_id, self.action_time
        )?;
        if self.is_protocol_command() {
            write!(f, " sub={}", self.message_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_message() -> ActionMessage {
        let mut cmd = ActionMessage::new(Action::TimeRequest);
        cmd.source_id = GlobalFederateId::new_federate(3);
        cmd.dest_id = GlobalFederateId::new_federate(4);
        cmd.action_time = Time::from_secs(2);
        cmd.te = Time::from_secs(3);
        cmd.tdemin = Time::from_secs(2);
        cmd.counter = 2;
        cmd.set_flag(MessageFlags::ITERATION_REQUESTED);
        cmd.payload = SmallBuffer::from("hello world");
        cmd.string_data = vec!["alpha".into(), "beta".into()];
        cmd.name = "fed3".into();
        cmd
    }

    #[test]
    fn binary_round_trip() {
        let cmd = sample_message();
        let decoded = ActionMessage::from_bytes(&cmd.to_bytes()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn json_round_trip() {
        let cmd = sample_message();
        let decoded = ActionMessage::from_json(cmd.to_json_string().as_bytes()).unwrap();
        assert_eq!(decoded, cmd);
    }

    #[test]
    fn packetize_round_trip_and_prefix() {
        let cmd = sample_message();
        let frame = cmd.packetize();
        let (decoded, used) = ActionMessage::depacketize(&frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(decoded, cmd);
        for cut in 0..frame.len() {
            assert!(
                ActionMessage::depacketize(&frame[..cut]).unwrap().is_none(),
                "strict prefix of length {cut} must not parse"
            );
        }
    }

    #[test]
    fn classification() {
        assert!(ActionMessage::new(Action::RegFed).is_priority_command());
        assert!(!ActionMessage::new(Action::TimeRequest).is_priority_command());
        assert!(ActionMessage::protocol(protocol::DISCONNECT).is_disconnect_command());
        assert!(ActionMessage::protocol_priority(protocol::NEW_ROUTE).is_protocol_command());
        assert!(!ActionMessage::new(Action::Invalid).is_valid_command());
    }

    proptest! {
        #[test]
        fn depacketize_never_panics_on_noise(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let _ = ActionMessage::depacketize(&data);
        }

        #[test]
        fn packetize_round_trips_payloads(payload in proptest::collection::vec(any::<u8>(), 0..128)) {
            let mut cmd = ActionMessage::new(Action::Publish);
            cmd.payload = SmallBuffer::from(payload.clone());
            let frame = cmd.packetize();
            let (decoded, used) = ActionMessage::depacketize(&frame).unwrap().unwrap();
            prop_assert_eq!(used, frame.len());
            prop_assert_eq!(decoded.payload.as_bytes(), &payload[..]);
        }
    }
}
