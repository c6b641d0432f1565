//! Chat wire protocol — the tagged packet union.
//!
//! Every frame on the wire carries exactly one `Packet`, serialized as a
//! tagged JSON object. `Data` is the payload users actually see; the rest
//! is mesh plumbing (node gossip, backfill, liveness).

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::config::ClientConfig;

/// A `Data` packet whose text equals this (trimmed, case-insensitive) ends
/// the sending session.
pub const TERMINATION_KEYWORD: &str = "exit";

/// One relayable chat message. Immutable once built; `origin` + `sequence`
/// identify it globally so relays can drop duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    pub username: String,
    pub origin: String,
    pub sequence: u64,
    pub text: String,
}

impl DataMessage {
    pub fn new(
        username: impl Into<String>,
        origin: impl Into<String>,
        sequence: u64,
        text: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            origin: origin.into(),
            sequence,
            text: text.into(),
        }
    }

    /// Global dedup key: `origin:sequence`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.origin, self.sequence)
    }

    /// Whether this message ends the sending session.
    pub fn is_termination(&self) -> bool {
        self.text.trim().eq_ignore_ascii_case(TERMINATION_KEYWORD)
    }
}

/// One known relay node, as gossiped in `Servers` packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// The node's origin id.
    pub id: String,
    /// Host or address the node is reachable at.
    pub location: String,
}

/// The on-the-wire packet union — one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Packet {
    /// A chat message to relay.
    #[serde(rename = "data")]
    Data(DataMessage),

    /// A client or node announcing itself after connecting.
    #[serde(rename = "new_user")]
    NewUser {
        username: String,
        id: String,
        #[serde(default)]
        is_node: bool,
    },

    /// Full known-node snapshot (gossip propagation).
    #[serde(rename = "servers")]
    Servers { servers: Vec<ServerEntry> },

    /// Backfill request: `id` is `origin:low` or `origin:low-high`.
    #[serde(rename = "data_request")]
    DataRequest { id: String },

    /// Backfill reply — cached messages only, never re-broadcast.
    #[serde(rename = "data_package")]
    DataPackage { messages: Vec<DataMessage> },

    /// Liveness probe. A ping without `load` is answered with a fresh ping.
    #[serde(rename = "ping")]
    Ping {
        time_sent: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        load: Option<String>,
    },
}

impl Packet {
    /// A chat message stamped with the sender's identity and next sequence.
    pub fn data(config: &ClientConfig, text: impl Into<String>) -> Self {
        Packet::Data(DataMessage::new(
            config.username(),
            config.origin(),
            config.next_sequence(),
            text,
        ))
    }

    /// Self-announcement sent right after connecting.
    pub fn new_user(config: &ClientConfig, is_node: bool) -> Self {
        Packet::NewUser {
            username: config.username().to_owned(),
            id: config.origin().to_owned(),
            is_node,
        }
    }

    /// A backfill request for `origin` sequences `start..=end` (or just
    /// `start` when `end` is absent). `end` must be strictly greater than
    /// `start` when given.
    pub fn request(
        origin: &str,
        start: u64,
        end: Option<u64>,
    ) -> Result<Self, RequestIdError> {
        match end {
            None => Ok(Packet::DataRequest {
                id: format!("{origin}:{start}"),
            }),
            Some(end) if end > start => Ok(Packet::DataRequest {
                id: format!("{origin}:{start}-{end}"),
            }),
            Some(end) => Err(RequestIdError::InvertedRange { low: start, high: end }),
        }
    }

    /// A fresh liveness probe carrying the current wall clock.
    pub fn ping() -> Self {
        Packet::Ping {
            time_sent: unix_millis(),
            load: None,
        }
    }

    pub fn package(messages: Vec<DataMessage>) -> Self {
        Packet::DataPackage { messages }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A parsed backfill request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRange {
    pub origin: String,
    pub low: u64,
    pub high: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum RequestIdError {
    #[error("request id has no `origin:sequence` separator")]
    MissingSeparator,
    #[error("request id has an empty origin")]
    EmptyOrigin,
    #[error("request id sequence is not a number: {0}")]
    InvalidSequence(#[from] std::num::ParseIntError),
    #[error("request range end {high} is not after start {low}")]
    InvertedRange { low: u64, high: u64 },
}

impl RequestRange {
    /// Parses `origin:low` or `origin:low-high`. A bare `origin:low` is a
    /// range of one (`high == low`).
    pub fn parse(id: &str) -> Result<Self, RequestIdError> {
        let (origin, range) = id.split_once(':').ok_or(RequestIdError::MissingSeparator)?;
        if origin.is_empty() {
            return Err(RequestIdError::EmptyOrigin);
        }
        let (low, high) = match range.split_once('-') {
            Some((low, high)) => (low.parse()?, high.parse()?),
            None => {
                let low: u64 = range.parse()?;
                (low, low)
            }
        };
        if high < low {
            return Err(RequestIdError::InvertedRange { low, high });
        }
        Ok(Self {
            origin: origin.to_owned(),
            low,
            high,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> ClientConfig {
        ClientConfig::new("alice", "correct horse battery", 0).unwrap()
    }

    #[test]
    fn data_round_trip() {
        let msg = DataMessage::new("alice", "origin-1", 7, "hello there");
        let packet = Packet::Data(msg.clone());
        let json = serde_json::to_string(&packet).unwrap();
        assert!(json.contains(r#""type":"data""#));
        assert!(json.contains(r#""sequence":7"#));

        let decoded: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, Packet::Data(msg));
    }

    #[test]
    fn data_constructor_advances_sequence() {
        let config = config();
        let first = Packet::data(&config, "one");
        let second = Packet::data(&config, "two");
        match (first, second) {
            (Packet::Data(a), Packet::Data(b)) => {
                assert_eq!(a.origin, b.origin);
                assert_eq!(b.sequence, a.sequence + 1);
            }
            other => panic!("expected two Data packets, got {other:?}"),
        }
    }

    #[test]
    fn dedup_key_is_origin_and_sequence() {
        let msg = DataMessage::new("alice", "abc-123", 42, "x");
        assert_eq!(msg.key(), "abc-123:42");
    }

    #[test]
    fn termination_is_trimmed_and_case_insensitive() {
        assert!(DataMessage::new("a", "o", 1, "  EXIT \n").is_termination());
        assert!(DataMessage::new("a", "o", 2, "exit").is_termination());
        assert!(!DataMessage::new("a", "o", 3, "exit now").is_termination());
    }

    #[test]
    fn new_user_defaults_is_node_false() {
        let json = r#"{"type":"new_user","username":"bob","id":"xyz"}"#;
        let decoded: Packet = serde_json::from_str(json).unwrap();
        match decoded {
            Packet::NewUser { username, id, is_node } => {
                assert_eq!(username, "bob");
                assert_eq!(id, "xyz");
                assert!(!is_node);
            }
            other => panic!("expected NewUser, got {other:?}"),
        }
    }

    #[test]
    fn servers_round_trip() {
        let packet = Packet::Servers {
            servers: vec![ServerEntry {
                id: "node-a".into(),
                location: "10.0.0.1".into(),
            }],
        };
        let json = serde_json::to_string(&packet).unwrap();
        let decoded: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn ping_omits_absent_load() {
        let json = serde_json::to_string(&Packet::ping()).unwrap();
        assert!(json.contains(r#""type":"ping""#));
        assert!(!json.contains("load"));
    }

    #[test]
    fn request_single_id() {
        let packet = Packet::request("abc", 5, None).unwrap();
        assert_eq!(packet, Packet::DataRequest { id: "abc:5".into() });
    }

    #[test]
    fn request_rejects_end_not_after_start() {
        assert!(matches!(
            Packet::request("abc", 5, Some(5)),
            Err(RequestIdError::InvertedRange { low: 5, high: 5 })
        ));
        assert!(matches!(
            Packet::request("abc", 5, Some(3)),
            Err(RequestIdError::InvertedRange { low: 5, high: 3 })
        ));
    }

    #[test]
    fn parse_range_id() {
        let range = RequestRange::parse("origin-1:3-6").unwrap();
        assert_eq!(
            range,
            RequestRange {
                origin: "origin-1".into(),
                low: 3,
                high: 6,
            }
        );
    }

    #[test]
    fn parse_single_id_is_range_of_one() {
        let range = RequestRange::parse("origin-1:9").unwrap();
        assert_eq!(range.low, 9);
        assert_eq!(range.high, 9);
    }

    #[test]
    fn parse_keeps_dashes_in_origin() {
        // UUID origins contain dashes; only the part after `:` is a range.
        let range = RequestRange::parse("550e8400-e29b-41d4:2-4").unwrap();
        assert_eq!(range.origin, "550e8400-e29b-41d4");
        assert_eq!((range.low, range.high), (2, 4));
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        assert!(matches!(
            RequestRange::parse("no-separator"),
            Err(RequestIdError::MissingSeparator)
        ));
        assert!(matches!(
            RequestRange::parse(":5"),
            Err(RequestIdError::EmptyOrigin)
        ));
        assert!(matches!(
            RequestRange::parse("abc:five"),
            Err(RequestIdError::InvalidSequence(_))
        ));
        assert!(matches!(
            RequestRange::parse("abc:6-2"),
            Err(RequestIdError::InvertedRange { low: 6, high: 2 })
        ));
    }

    #[test]
    fn unknown_type_fails() {
        let json = r#"{"type":"bogus","data":"hello"}"#;
        assert!(serde_json::from_str::<Packet>(json).is_err());
    }
}
