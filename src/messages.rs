//! Fixed wire schemas exchanged between agents.
//!
//! Payloads travel as JSON. Everything is validated on receipt and anything
//! that does not fit its schema is rejected before it touches agent state.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auction::BidValue;
use crate::error::{Error, Result};
use crate::grid::{Cell, CellMatrix, GridKnowledge};
use crate::types::{AgentId, BlockKind, Position};

/// Message type of an acknowledgement; acknowledgements are never answered.
pub const ACK_MESSAGE_TYPE: &str = "received";

fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}

/// A bid broadcast on the auction topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BidMessage {
    pub message_id: String,
    /// Auction key (`{subtask}@{round}`).
    pub subtask_id: String,
    pub agent_id: AgentId,
    /// `None` is the InvalidBid marker.
    pub value: Option<u32>,
}

impl BidMessage {
    pub fn new(subtask_id: &str, agent_id: &str, value: BidValue) -> Self {
        Self {
            message_id: new_message_id(),
            subtask_id: subtask_id.to_string(),
            agent_id: agent_id.to_string(),
            value: value.cost(),
        }
    }

    pub fn bid_value(&self) -> BidValue {
        BidValue::from(self.value)
    }

    fn validate(&self) -> Result<()> {
        if self.subtask_id.is_empty() || self.agent_id.is_empty() {
            return Err(Error::MalformedMessage(
                "bid message without subtask or agent".to_string(),
            ));
        }
        Ok(())
    }
}

/// A dispenser entry inside a map message, in the sender's matrix frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenserRecord {
    pub row: i32,
    pub col: i32,
    pub kind: BlockKind,
}

/// A full map snapshot broadcast once the sender has found the goal area.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapMessage {
    pub message_id: String,
    pub agent_id: AgentId,
    /// One byte per cell, row-major.
    pub serialized_map: Vec<u8>,
    pub landmark_row: i32,
    pub landmark_col: i32,
    pub rows: usize,
    pub cols: usize,
    #[serde(default)]
    pub dispensers: Vec<DispenserRecord>,
}

impl MapMessage {
    /// Snapshot of `grid`; fails if the goal area is not fully discovered.
    pub fn from_grid(grid: &GridKnowledge) -> Result<Self> {
        let landmark = grid.landmark().ok_or(Error::UndiscoveredGoal)?;
        let matrix = grid.matrix();
        Ok(Self {
            message_id: new_message_id(),
            agent_id: grid.agent().to_string(),
            serialized_map: matrix.to_bytes(),
            landmark_row: landmark.row,
            landmark_col: landmark.col,
            rows: matrix.rows(),
            cols: matrix.cols(),
            dispensers: grid
                .dispensers()
                .map(|(pos, kind)| DispenserRecord {
                    row: pos.row,
                    col: pos.col,
                    kind: kind.to_string(),
                })
                .collect(),
        })
    }

    /// Check shape, cell codes and landmark, producing a mergeable map.
    pub fn validate(self) -> Result<RemoteMap> {
        let matrix = CellMatrix::from_bytes(self.rows, self.cols, &self.serialized_map)?;
        let landmark = Position::new(self.landmark_row, self.landmark_col);
        match matrix.get(landmark) {
            None => {
                return Err(Error::MalformedMapMessage(format!(
                    "landmark {landmark} outside {}x{} map",
                    self.rows, self.cols
                )));
            }
            Some(Cell::Goal) => {}
            Some(other) => {
                return Err(Error::MalformedMapMessage(format!(
                    "landmark {landmark} is {other:?}, not a goal cell"
                )));
            }
        }
        let mut dispensers = Vec::with_capacity(self.dispensers.len());
        for record in self.dispensers {
            let pos = Position::new(record.row, record.col);
            if !matrix.contains(pos) {
                return Err(Error::MalformedMapMessage(format!(
                    "dispenser {pos} outside map"
                )));
            }
            dispensers.push((pos, record.kind));
        }
        Ok(RemoteMap {
            agent_id: self.agent_id,
            matrix,
            landmark,
            dispensers,
        })
    }
}

/// A validated peer map ready to be merged.
#[derive(Clone, Debug)]
pub struct RemoteMap {
    pub agent_id: AgentId,
    pub matrix: CellMatrix,
    pub landmark: Position,
    pub dispensers: Vec<(Position, BlockKind)>,
}

/// Point-to-point text message between two agents.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTextMessage {
    pub message_id: String,
    pub from: AgentId,
    pub to: AgentId,
    pub message_type: String,
    pub params: String,
}

impl PeerTextMessage {
    pub fn new(from: &str, to: &str, message_type: &str, params: &str) -> Self {
        Self {
            message_id: new_message_id(),
            from: from.to_string(),
            to: to.to_string(),
            message_type: message_type.to_string(),
            params: params.to_string(),
        }
    }

    /// Acknowledgement of this message, sent back by its recipient.
    pub fn ack(&self) -> Self {
        Self::new(&self.to, &self.from, ACK_MESSAGE_TYPE, &self.message_id)
    }

    pub fn is_ack(&self) -> bool {
        self.message_type == ACK_MESSAGE_TYPE
    }
}

/// A decoded and validated message waiting in an agent's mailbox.
#[derive(Clone, Debug)]
pub enum Inbound {
    Bid(BidMessage),
    Map(RemoteMap),
    Text(PeerTextMessage),
}

impl Inbound {
    pub fn sender(&self) -> &str {
        match self {
            Inbound::Bid(bid) => &bid.agent_id,
            Inbound::Map(map) => &map.agent_id,
            Inbound::Text(text) => &text.from,
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode_bid(payload: &[u8]) -> Result<Inbound> {
    let bid: BidMessage = serde_json::from_slice(payload)?;
    bid.validate()?;
    Ok(Inbound::Bid(bid))
}

pub fn decode_map(payload: &[u8]) -> Result<Inbound> {
    let map: MapMessage = serde_json::from_slice(payload)?;
    Ok(Inbound::Map(map.validate()?))
}

pub fn decode_text(payload: &[u8]) -> Result<Inbound> {
    let text: PeerTextMessage = serde_json::from_slice(payload)?;
    Ok(Inbound::Text(text))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_message(rows: usize, cols: usize, cells: Vec<u8>, landmark: (i32, i32)) -> MapMessage {
        MapMessage {
            message_id: "m1".to_string(),
            agent_id: "agentA2".to_string(),
            serialized_map: cells,
            landmark_row: landmark.0,
            landmark_col: landmark.1,
            rows,
            cols,
            dispensers: Vec::new(),
        }
    }

    #[test]
    fn invalid_bid_marker_is_null_on_the_wire() {
        let bid = BidMessage::new("t1_0@0", "agentA1", BidValue::Invalid);
        let payload = encode(&bid).expect("encode");
        let text = String::from_utf8(payload.clone()).expect("utf8");
        assert!(text.contains("\"value\":null"));
        match decode_bid(&payload).expect("decode") {
            Inbound::Bid(decoded) => assert_eq!(decoded.bid_value(), BidValue::Invalid),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn bid_missing_fields_is_rejected() {
        assert!(decode_bid(br#"{"message_id":"x","agent_id":"a"}"#).is_err());
        assert!(decode_bid(br#"{"message_id":"x","subtask_id":"","agent_id":"a","value":3}"#).is_err());
    }

    #[test]
    fn map_with_wrong_shape_is_rejected() {
        let msg = map_message(2, 3, vec![3, 1, 1, 1, 1], (0, 0));
        assert!(matches!(msg.validate(), Err(Error::MalformedMapMessage(_))));
    }

    #[test]
    fn map_with_landmark_outside_is_rejected() {
        let msg = map_message(2, 2, vec![3, 1, 1, 1], (2, 0));
        assert!(matches!(msg.validate(), Err(Error::MalformedMapMessage(_))));
    }

    #[test]
    fn map_landmark_must_be_goal() {
        let msg = map_message(2, 2, vec![1, 3, 1, 1], (0, 0));
        assert!(msg.validate().is_err());
        let msg = map_message(2, 2, vec![1, 3, 1, 1], (0, 1));
        let remote = msg.validate().expect("valid map");
        assert_eq!(remote.landmark, Position::new(0, 1));
    }

    #[test]
    fn ack_points_back_at_sender() {
        let msg = PeerTextMessage::new("agentA1", "agentA2", "task", "[5,5]");
        let ack = msg.ack();
        assert_eq!(ack.to, "agentA1");
        assert_eq!(ack.params, msg.message_id);
        assert!(ack.is_ack());
    }
}
