#![forbid(unsafe_code)]

use courier_domain::{Message, MessageDraft, MessageId, Room, RoomId, Timestamp};
use tokio::sync::broadcast;

use crate::error::StoreError;

pub mod memory;
pub mod persistent;

/// Outcome of a successful `append`.
#[derive(Debug, Clone)]
pub enum Appended {
	/// The message was committed at a freshly assigned position.
	Committed(Message),

	/// An identical message (same id and payload) was already in the log.
	/// Retries after ambiguous network failures land here; no new commit
	/// event is emitted.
	Deduplicated(Message),
}

impl Appended {
	pub fn message(&self) -> &Message {
		match self {
			Appended::Committed(m) | Appended::Deduplicated(m) => m,
		}
	}

	pub fn into_message(self) -> Message {
		match self {
			Appended::Committed(m) | Appended::Deduplicated(m) => m,
		}
	}

	pub fn is_new(&self) -> bool {
		matches!(self, Appended::Committed(_))
	}
}

/// Mutation events observed on the store commit stream.
///
/// This core only ever produces `Added`: messages are immutable and have no
/// delete path. The other variants exist for parity with document stores
/// that emit them; the feed router drops them on the floor.
#[derive(Debug, Clone)]
pub enum StoreEvent {
	Added(Message),
	Modified(Message),
	Removed { room: RoomId, id: MessageId },
}

/// Append-only per-room message log plus room metadata.
///
/// Implementations must make `append` atomic at single-message granularity;
/// the latest-message pointer update is deliberately a separate,
/// non-atomic operation (the pointer may lag, never dangle).
#[async_trait::async_trait]
pub trait MessageStore: Send + Sync {
	/// Register a new room. Fails with `RoomExists` if the id is taken.
	async fn create_room(&self, room: Room) -> Result<Room, StoreError>;

	/// Fetch a room's current metadata.
	async fn room(&self, room: &RoomId) -> Result<Room, StoreError>;

	/// Append a message, assigning `created_at` and the per-room sequence
	/// number at acceptance time.
	async fn append(&self, room: &RoomId, draft: MessageDraft) -> Result<Appended, StoreError>;

	/// All messages with `created_at >= since`, ascending by position.
	async fn list_since(&self, room: &RoomId, since: Timestamp) -> Result<Vec<Message>, StoreError>;

	/// Point the room's latest-message reference at `id`. The message must
	/// already be durably persisted in that room.
	async fn set_latest_message(&self, room: &RoomId, id: &MessageId) -> Result<(), StoreError>;

	/// Subscribe to commit events for appends performed through this store
	/// handle. At-least-once; receivers that fall behind observe a lag error
	/// and recover by re-reading the log.
	fn subscribe_commits(&self) -> broadcast::Receiver<StoreEvent>;
}
