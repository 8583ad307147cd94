#![forbid(unsafe_code)]

use anyhow::{Context, anyhow};
use courier_domain::{Message, MessageDraft, MessageId, Room, RoomId, Timestamp, UserId};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::store::{Appended, MessageStore, StoreEvent};
use crate::util::time::unix_ms_now;

const COMMIT_CHANNEL_CAPACITY: usize = 1024;

/// Durable message store over sqlx (sqlite or postgres by URL scheme).
///
/// Commit events cover appends performed through this handle; cross-process
/// change notification belongs to the persistence transport, not this core.
#[derive(Clone)]
pub struct PersistentStore {
	backend: Backend,
	commits: broadcast::Sender<StoreEvent>,
}

#[derive(Clone)]
enum Backend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
}

impl PersistentStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let pool = sqlx::SqlitePool::connect(database_url).await.context("connect sqlite")?;
			Self::from_sqlite_pool(pool).await
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			Self::from_pg_pool(pool).await
		} else {
			Err(anyhow!("unsupported database_url (use sqlite: or postgres:)"))
		}
	}

	/// Build from an existing sqlite pool, running migrations.
	pub async fn from_sqlite_pool(pool: sqlx::SqlitePool) -> anyhow::Result<Self> {
		sqlx::migrate!("migrations/sqlite")
			.run(&pool)
			.await
			.context("run sqlite migrations")?;

		let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
		Ok(Self {
			backend: Backend::Sqlite(pool),
			commits,
		})
	}

	/// Build from an existing postgres pool, running migrations.
	pub async fn from_pg_pool(pool: sqlx::PgPool) -> anyhow::Result<Self> {
		sqlx::migrate!("migrations/postgres")
			.run(&pool)
			.await
			.context("run postgres migrations")?;

		let (commits, _) = broadcast::channel(COMMIT_CHANNEL_CAPACITY);
		Ok(Self {
			backend: Backend::Postgres(pool),
			commits,
		})
	}
}

type MessageRow = (String, String, String, String, i64, i64);

fn row_to_message(room: &RoomId, row: MessageRow) -> anyhow::Result<Message> {
	let (id, sender_id, sender_name, body, created_at_ms, seq) = row;
	Ok(Message {
		id: MessageId::new(id).context("stored message id")?,
		room_id: room.clone(),
		sender_id: UserId::new(sender_id).context("stored sender id")?,
		sender_name,
		body,
		created_at: Timestamp(created_at_ms),
		seq: seq as u64,
	})
}

fn room_from_columns(
	room: &RoomId,
	participant_a: String,
	participant_b: String,
	latest_message_id: Option<String>,
) -> anyhow::Result<Room> {
	let latest = match latest_message_id {
		Some(id) => Some(MessageId::new(id).context("stored latest message id")?),
		None => None,
	};
	Ok(Room {
		id: room.clone(),
		participants: [
			UserId::new(participant_a).context("stored participant")?,
			UserId::new(participant_b).context("stored participant")?,
		],
		latest_message_id: latest,
	})
}

#[async_trait::async_trait]
impl MessageStore for PersistentStore {
	async fn create_room(&self, room: Room) -> Result<Room, StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM rooms WHERE id = ?")
					.bind(room.id.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select room (sqlite)")?;
				if existing.is_some() {
					return Err(StoreError::RoomExists(room.id));
				}

				sqlx::query("INSERT INTO rooms (id, participant_a, participant_b, latest_message_id) VALUES (?, ?, ?, NULL)")
					.bind(room.id.as_str())
					.bind(room.participants[0].as_str())
					.bind(room.participants[1].as_str())
					.execute(&mut *tx)
					.await
					.context("insert room (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let existing: Option<(String,)> = sqlx::query_as("SELECT id FROM rooms WHERE id = $1")
					.bind(room.id.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select room (postgres)")?;
				if existing.is_some() {
					return Err(StoreError::RoomExists(room.id));
				}

				sqlx::query("INSERT INTO rooms (id, participant_a, participant_b, latest_message_id) VALUES ($1, $2, $3, NULL)")
					.bind(room.id.as_str())
					.bind(room.participants[0].as_str())
					.bind(room.participants[1].as_str())
					.execute(&mut *tx)
					.await
					.context("insert room (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
			}
		}

		Ok(room)
	}

	async fn room(&self, room: &RoomId) -> Result<Room, StoreError> {
		let row: Option<(String, String, Option<String>)> = match &self.backend {
			Backend::Sqlite(pool) => {
				sqlx::query_as("SELECT participant_a, participant_b, latest_message_id FROM rooms WHERE id = ?")
					.bind(room.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (sqlite)")?
			}
			Backend::Postgres(pool) => {
				sqlx::query_as("SELECT participant_a, participant_b, latest_message_id FROM rooms WHERE id = $1")
					.bind(room.as_str())
					.fetch_optional(pool)
					.await
					.context("select room (postgres)")?
			}
		};

		let Some((a, b, latest)) = row else {
			return Err(StoreError::UnknownRoom(room.clone()));
		};
		Ok(room_from_columns(room, a, b, latest)?)
	}

	async fn append(&self, room: &RoomId, draft: MessageDraft) -> Result<Appended, StoreError> {
		let committed = match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;

				let room_row: Option<(String, String)> =
					sqlx::query_as("SELECT participant_a, participant_b FROM rooms WHERE id = ?")
						.bind(room.as_str())
						.fetch_optional(&mut *tx)
						.await
						.context("select room (sqlite)")?;
				let Some((a, b)) = room_row else {
					return Err(StoreError::UnknownRoom(room.clone()));
				};
				if draft.sender_id.as_str() != a && draft.sender_id.as_str() != b {
					return Err(StoreError::Unauthorized(room.clone()));
				}

				let existing: Option<MessageRow> = sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at_ms, seq FROM messages WHERE room_id = ? AND id = ?",
				)
				.bind(room.as_str())
				.bind(draft.id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select message by id (sqlite)")?;
				if let Some(row) = existing {
					let stored = row_to_message(room, row)?;
					return if draft.same_payload(&stored) {
						Ok(Appended::Deduplicated(stored))
					} else {
						Err(StoreError::Conflict {
							room: room.clone(),
							id: draft.id,
						})
					};
				}

				let last: Option<(i64, i64)> = sqlx::query_as(
					"SELECT created_at_ms, seq FROM messages WHERE room_id = ? ORDER BY created_at_ms DESC, seq DESC LIMIT 1",
				)
				.bind(room.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select last position (sqlite)")?;

				let (created_at, seq) = next_position(last);
				sqlx::query(
					"INSERT INTO messages (room_id, id, sender_id, sender_name, body, created_at_ms, seq) \
					VALUES (?, ?, ?, ?, ?, ?, ?)",
				)
				.bind(room.as_str())
				.bind(draft.id.as_str())
				.bind(draft.sender_id.as_str())
				.bind(&draft.sender_name)
				.bind(&draft.body)
				.bind(created_at.as_millis())
				.bind(seq as i64)
				.execute(&mut *tx)
				.await
				.context("insert message (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;

				Message {
					id: draft.id,
					room_id: room.clone(),
					sender_id: draft.sender_id,
					sender_name: draft.sender_name,
					body: draft.body,
					created_at,
					seq,
				}
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;

				// Row lock serializes concurrent appends for the room.
				let room_row: Option<(String, String)> =
					sqlx::query_as("SELECT participant_a, participant_b FROM rooms WHERE id = $1 FOR UPDATE")
						.bind(room.as_str())
						.fetch_optional(&mut *tx)
						.await
						.context("select room (postgres)")?;
				let Some((a, b)) = room_row else {
					return Err(StoreError::UnknownRoom(room.clone()));
				};
				if draft.sender_id.as_str() != a && draft.sender_id.as_str() != b {
					return Err(StoreError::Unauthorized(room.clone()));
				}

				let existing: Option<MessageRow> = sqlx::query_as(
					"SELECT id, sender_id, sender_name, body, created_at_ms, seq FROM messages WHERE room_id = $1 AND id = $2",
				)
				.bind(room.as_str())
				.bind(draft.id.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select message by id (postgres)")?;
				if let Some(row) = existing {
					let stored = row_to_message(room, row)?;
					return if draft.same_payload(&stored) {
						Ok(Appended::Deduplicated(stored))
					} else {
						Err(StoreError::Conflict {
							room: room.clone(),
							id: draft.id,
						})
					};
				}

				let last: Option<(i64, i64)> = sqlx::query_as(
					"SELECT created_at_ms, seq FROM messages WHERE room_id = $1 ORDER BY created_at_ms DESC, seq DESC LIMIT 1",
				)
				.bind(room.as_str())
				.fetch_optional(&mut *tx)
				.await
				.context("select last position (postgres)")?;

				let (created_at, seq) = next_position(last);
				sqlx::query(
					"INSERT INTO messages (room_id, id, sender_id, sender_name, body, created_at_ms, seq) \
					VALUES ($1, $2, $3, $4, $5, $6, $7)",
				)
				.bind(room.as_str())
				.bind(draft.id.as_str())
				.bind(draft.sender_id.as_str())
				.bind(&draft.sender_name)
				.bind(&draft.body)
				.bind(created_at.as_millis())
				.bind(seq as i64)
				.execute(&mut *tx)
				.await
				.context("insert message (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;

				Message {
					id: draft.id,
					room_id: room.clone(),
					sender_id: draft.sender_id,
					sender_name: draft.sender_name,
					body: draft.body,
					created_at,
					seq,
				}
			}
		};

		metrics::counter!("courier_store_messages_appended_total").increment(1);
		let _ = self.commits.send(StoreEvent::Added(committed.clone()));

		Ok(Appended::Committed(committed))
	}

	async fn list_since(&self, room: &RoomId, since: Timestamp) -> Result<Vec<Message>, StoreError> {
		// The room must exist even when its log is empty.
		let _ = self.room(room).await?;

		let rows: Vec<MessageRow> = match &self.backend {
			Backend::Sqlite(pool) => sqlx::query_as(
				"SELECT id, sender_id, sender_name, body, created_at_ms, seq FROM messages \
				WHERE room_id = ? AND created_at_ms >= ? ORDER BY created_at_ms ASC, seq ASC",
			)
			.bind(room.as_str())
			.bind(since.as_millis())
			.fetch_all(pool)
			.await
			.context("select messages (sqlite)")?,
			Backend::Postgres(pool) => sqlx::query_as(
				"SELECT id, sender_id, sender_name, body, created_at_ms, seq FROM messages \
				WHERE room_id = $1 AND created_at_ms >= $2 ORDER BY created_at_ms ASC, seq ASC",
			)
			.bind(room.as_str())
			.bind(since.as_millis())
			.fetch_all(pool)
			.await
			.context("select messages (postgres)")?,
		};

		let mut messages = Vec::with_capacity(rows.len());
		for row in rows {
			messages.push(row_to_message(room, row)?);
		}
		Ok(messages)
	}

	async fn set_latest_message(&self, room: &RoomId, id: &MessageId) -> Result<(), StoreError> {
		match &self.backend {
			Backend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				let room_row: Option<(String,)> = sqlx::query_as("SELECT id FROM rooms WHERE id = ?")
					.bind(room.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select room (sqlite)")?;
				if room_row.is_none() {
					return Err(StoreError::UnknownRoom(room.clone()));
				}

				let message_row: Option<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE room_id = ? AND id = ?")
					.bind(room.as_str())
					.bind(id.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select message (sqlite)")?;
				if message_row.is_none() {
					return Err(StoreError::UnknownMessage {
						room: room.clone(),
						id: id.clone(),
					});
				}

				sqlx::query("UPDATE rooms SET latest_message_id = ? WHERE id = ?")
					.bind(id.as_str())
					.bind(room.as_str())
					.execute(&mut *tx)
					.await
					.context("update latest message (sqlite)")?;
				tx.commit().await.context("commit sqlite tx")?;
			}
			Backend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				let room_row: Option<(String,)> = sqlx::query_as("SELECT id FROM rooms WHERE id = $1")
					.bind(room.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select room (postgres)")?;
				if room_row.is_none() {
					return Err(StoreError::UnknownRoom(room.clone()));
				}

				let message_row: Option<(String,)> = sqlx::query_as("SELECT id FROM messages WHERE room_id = $1 AND id = $2")
					.bind(room.as_str())
					.bind(id.as_str())
					.fetch_optional(&mut *tx)
					.await
					.context("select message (postgres)")?;
				if message_row.is_none() {
					return Err(StoreError::UnknownMessage {
						room: room.clone(),
						id: id.clone(),
					});
				}

				sqlx::query("UPDATE rooms SET latest_message_id = $1 WHERE id = $2")
					.bind(id.as_str())
					.bind(room.as_str())
					.execute(&mut *tx)
					.await
					.context("update latest message (postgres)")?;
				tx.commit().await.context("commit postgres tx")?;
			}
		}

		Ok(())
	}

	fn subscribe_commits(&self) -> broadcast::Receiver<StoreEvent> {
		self.commits.subscribe()
	}
}

fn next_position(last: Option<(i64, i64)>) -> (Timestamp, u64) {
	let now = Timestamp(unix_ms_now());
	match last {
		Some((last_ms, last_seq)) => (Timestamp(last_ms).max(now), last_seq as u64 + 1),
		None => (Timestamp::ZERO.max(now), 1),
	}
}
