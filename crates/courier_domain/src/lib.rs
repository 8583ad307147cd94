#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid character in identifier: {0:?}")]
	InvalidChar(char),
	#[error("identifier too long: {0} chars (max {MAX_ID_CHARS})")]
	TooLong(usize),
}

/// Maximum accepted length for a `MessageId`.
pub const MAX_ID_CHARS: usize = 64;

/// Length of generated message ids.
pub const GENERATED_ID_CHARS: usize = 20;

const ID_ALPHABET: &[u8; 62] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Room (conversation) identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
	/// Create a non-empty `RoomId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for RoomId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for RoomId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		RoomId::new(s.to_string())
	}
}

/// Authenticated user identifier, issued by the external auth provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
	/// Create a non-empty `UserId`.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.trim().is_empty() {
			return Err(ParseIdError::Empty);
		}
		Ok(Self(id))
	}
	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for UserId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for UserId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		UserId::new(s.to_string())
	}
}

/// Client-generated message identifier: alphanumeric, unique within a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
	/// Create a `MessageId` from an existing string, validating the alphabet.
	pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
		let id = id.into();
		if id.is_empty() {
			return Err(ParseIdError::Empty);
		}
		if id.len() > MAX_ID_CHARS {
			return Err(ParseIdError::TooLong(id.len()));
		}
		if let Some(c) = id.chars().find(|c| !c.is_ascii_alphanumeric()) {
			return Err(ParseIdError::InvalidChar(c));
		}
		Ok(Self(id))
	}

	/// Generate a fresh random id without any server round-trip.
	///
	/// 62^20 possible values; collisions are left to the store's uniqueness
	/// enforcement rather than checked client-side.
	pub fn generate() -> Self {
		use rand::Rng;

		let mut rng = rand::rng();
		let mut id = String::with_capacity(GENERATED_ID_CHARS);
		for _ in 0..GENERATED_ID_CHARS {
			let idx = rng.random_range(0..ID_ALPHABET.len());
			id.push(ID_ALPHABET[idx] as char);
		}
		Self(id)
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
	pub fn into_string(self) -> String {
		self.0
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		MessageId::new(s.to_string())
	}
}

/// Milliseconds since the Unix epoch, assigned by the store at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
	pub const ZERO: Timestamp = Timestamp(0);

	pub fn as_millis(self) -> i64 {
		self.0
	}

	/// The next representable timestamp.
	pub fn next_millis(self) -> Timestamp {
		Timestamp(self.0.saturating_add(1))
	}
}

impl fmt::Display for Timestamp {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Canonical per-room ordering key: `created_at` with ties broken by the
/// insertion sequence number. Strictly increasing within a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
	pub at: Timestamp,
	pub seq: u64,
}

impl LogPosition {
	pub fn new(at: Timestamp, seq: u64) -> Self {
		Self { at, seq }
	}
}

impl fmt::Display for LogPosition {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}/{}", self.at, self.seq)
	}
}

/// A message as submitted by a sender, before the store assigns a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
	pub id: MessageId,
	pub sender_id: UserId,
	pub sender_name: String,
	pub body: String,
}

impl MessageDraft {
	pub fn new(id: MessageId, sender_id: UserId, sender_name: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			id,
			sender_id,
			sender_name: sender_name.into(),
			body: body.into(),
		}
	}

	/// True when `other` is the same logical message (identical payload).
	pub fn same_payload(&self, other: &Message) -> bool {
		self.sender_id == other.sender_id && self.sender_name == other.sender_name && self.body == other.body
	}
}

/// An immutable, ordered unit of conversation content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	pub room_id: RoomId,
	pub sender_id: UserId,
	/// Snapshot of the sender's name at send time; never updated afterwards.
	pub sender_name: String,
	pub body: String,
	pub created_at: Timestamp,
	pub seq: u64,
}

impl Message {
	pub fn position(&self) -> LogPosition {
		LogPosition::new(self.created_at, self.seq)
	}
}

/// Error for constructing a `Room`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomError {
	#[error("a room requires two distinct participants")]
	SameParticipant,
}

/// A 1:1 conversation between a fixed pair of participants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub participants: [UserId; 2],
	/// Back-reference for room-list previews; may lag behind the log but must
	/// only ever point at a message that exists in it.
	pub latest_message_id: Option<MessageId>,
}

impl Room {
	pub fn new(id: RoomId, participants: [UserId; 2]) -> Result<Self, RoomError> {
		if participants[0] == participants[1] {
			return Err(RoomError::SameParticipant);
		}
		Ok(Self {
			id,
			participants,
			latest_message_id: None,
		})
	}

	pub fn is_participant(&self, user: &UserId) -> bool {
		self.participants.iter().any(|p| p == user)
	}
}

/// Display-layer view of a user. The image url is opaque to this core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub display_name: String,
	pub profile_image_url: Option<String>,
}

impl UserProfile {
	pub fn new(id: UserId, display_name: impl Into<String>) -> Self {
		Self {
			id,
			display_name: display_name.into(),
			profile_image_url: None,
		}
	}
}
