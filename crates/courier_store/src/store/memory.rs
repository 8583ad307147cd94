#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;

use courier_domain::{Message, MessageDraft, MessageId, Room, RoomId, Timestamp};
use tokio::sync::{Mutex, broadcast};
use tracing::debug;

use crate::error::StoreError;
use crate::store::{Appended, MessageStore, StoreEvent};
use crate::util::time::unix_ms_now;

/// Configuration for `InMemoryStore`.
#[derive(Debug, Clone)]
pub struct InMemoryStoreConfig {
	/// Capacity of the commit broadcast channel.
	pub commit_channel_capacity: usize,

	pub debug_logs: bool,
}

impl Default for InMemoryStoreConfig {
	fn default() -> Self {
		Self {
			commit_channel_capacity: 1024,
			debug_logs: false,
		}
	}
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Append-only in-memory message store.
///
/// Per-room logs live behind a single mutex; every append holds it for the
/// position assignment and insert, so two concurrent appends never
/// interleave partially.
#[derive(Clone)]
pub struct InMemoryStore {
	inner: Arc<Mutex<Inner>>,
	commits: broadcast::Sender<StoreEvent>,
	clock: Clock,
	cfg: InMemoryStoreConfig,
}

#[derive(Default)]
struct Inner {
	rooms: HashMap<RoomId, RoomState>,
}

struct RoomState {
	room: Room,
	log: Vec<Message>,
	index_by_id: HashMap<MessageId, usize>,
}

impl Default for InMemoryStore {
	fn default() -> Self {
		Self::new(InMemoryStoreConfig::default())
	}
}

impl InMemoryStore {
	pub fn new(cfg: InMemoryStoreConfig) -> Self {
		let (commits, _) = broadcast::channel(cfg.commit_channel_capacity);
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			commits,
			clock: Arc::new(unix_ms_now),
			cfg,
		}
	}

	/// Store with an injected wall clock. Positions stay strictly monotonic
	/// even when the clock runs backwards.
	pub fn with_clock(cfg: InMemoryStoreConfig, clock: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
		let (commits, _) = broadcast::channel(cfg.commit_channel_capacity);
		Self {
			inner: Arc::new(Mutex::new(Inner::default())),
			commits,
			clock,
			cfg,
		}
	}
}

#[async_trait::async_trait]
impl MessageStore for InMemoryStore {
	async fn create_room(&self, room: Room) -> Result<Room, StoreError> {
		let mut inner = self.inner.lock().await;
		if inner.rooms.contains_key(&room.id) {
			return Err(StoreError::RoomExists(room.id));
		}

		inner.rooms.insert(
			room.id.clone(),
			RoomState {
				room: room.clone(),
				log: Vec::new(),
				index_by_id: HashMap::new(),
			},
		);

		if self.cfg.debug_logs {
			debug!(room = %room.id, "store: room created");
		}

		Ok(room)
	}

	async fn room(&self, room: &RoomId) -> Result<Room, StoreError> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.get(room)
			.map(|s| s.room.clone())
			.ok_or_else(|| StoreError::UnknownRoom(room.clone()))
	}

	async fn append(&self, room: &RoomId, draft: MessageDraft) -> Result<Appended, StoreError> {
		let committed = {
			let mut inner = self.inner.lock().await;
			let state = inner
				.rooms
				.get_mut(room)
				.ok_or_else(|| StoreError::UnknownRoom(room.clone()))?;

			if !state.room.is_participant(&draft.sender_id) {
				return Err(StoreError::Unauthorized(room.clone()));
			}

			if let Some(&idx) = state.index_by_id.get(&draft.id) {
				let existing = &state.log[idx];
				return if draft.same_payload(existing) {
					Ok(Appended::Deduplicated(existing.clone()))
				} else {
					Err(StoreError::Conflict {
						room: room.clone(),
						id: draft.id,
					})
				};
			}

			let last = state.log.last();
			let now = Timestamp((self.clock)());
			// Clamp so created_at never runs backwards within a room; seq
			// breaks ties and keeps positions strictly increasing.
			let created_at = last.map(|m| m.created_at).unwrap_or(Timestamp::ZERO).max(now);
			let seq = last.map(|m| m.seq + 1).unwrap_or(1);

			let message = Message {
				id: draft.id,
				room_id: room.clone(),
				sender_id: draft.sender_id,
				sender_name: draft.sender_name,
				body: draft.body,
				created_at,
				seq,
			};

			state.index_by_id.insert(message.id.clone(), state.log.len());
			state.log.push(message.clone());
			message
		};

		metrics::counter!("courier_store_messages_appended_total").increment(1);
		if self.cfg.debug_logs {
			debug!(room = %room, id = %committed.id, position = %committed.position(), "store: message committed");
		}

		let _ = self.commits.send(StoreEvent::Added(committed.clone()));

		Ok(Appended::Committed(committed))
	}

	async fn list_since(&self, room: &RoomId, since: Timestamp) -> Result<Vec<Message>, StoreError> {
		let inner = self.inner.lock().await;
		let state = inner.rooms.get(room).ok_or_else(|| StoreError::UnknownRoom(room.clone()))?;

		let start = state.log.partition_point(|m| m.created_at < since);
		Ok(state.log[start..].to_vec())
	}

	async fn set_latest_message(&self, room: &RoomId, id: &MessageId) -> Result<(), StoreError> {
		let mut inner = self.inner.lock().await;
		let state = inner
			.rooms
			.get_mut(room)
			.ok_or_else(|| StoreError::UnknownRoom(room.clone()))?;

		if !state.index_by_id.contains_key(id) {
			return Err(StoreError::UnknownMessage {
				room: room.clone(),
				id: id.clone(),
			});
		}

		state.room.latest_message_id = Some(id.clone());
		Ok(())
	}

	fn subscribe_commits(&self) -> broadcast::Receiver<StoreEvent> {
		self.commits.subscribe()
	}
}
