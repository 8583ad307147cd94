#![forbid(unsafe_code)]

use courier_domain::{Message, MessageId, RoomId};
use thiserror::Error;

/// Errors from `MessageStore` operations.
#[derive(Debug, Error)]
pub enum StoreError {
	#[error("unknown room: {0}")]
	UnknownRoom(RoomId),

	#[error("no message {id} in room {room}")]
	UnknownMessage { room: RoomId, id: MessageId },

	#[error("room already exists: {0}")]
	RoomExists(RoomId),

	#[error("sender is not a participant of room {0}")]
	Unauthorized(RoomId),

	/// Same id re-appended with a different payload. Ids are client-generated
	/// and must never legitimately collide with different content, so this is
	/// surfaced as a bug signal rather than retried.
	#[error("message id {id} already exists in room {room} with a different payload")]
	Conflict { room: RoomId, id: MessageId },

	/// Transient backend failure; safe to retry the same operation.
	#[error("store backend error: {0}")]
	Backend(#[from] anyhow::Error),
}

/// Errors from the send pipeline, ordered by where in the pipeline they occur.
#[derive(Debug, Error)]
pub enum SendError {
	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("sender is not authorized for room {0}")]
	Unauthorized(RoomId),

	#[error("message id {id} collided with different content in room {room}")]
	Conflict { room: RoomId, id: MessageId },

	/// The message was NOT persisted. Retrying with the echoed id is safe and
	/// cannot duplicate the message.
	#[error("failed to persist message {id}")]
	PersistFailed {
		id: MessageId,
		#[source]
		source: StoreError,
	},

	/// The message IS durably persisted and visible on the feed; only the
	/// room's latest-message pointer is stale. Callers must not re-send; they
	/// retry the pointer update alone.
	#[error("message {id} persisted but the latest-message pointer update failed", id = .message.id)]
	MetadataUpdateFailed {
		message: Box<Message>,
		#[source]
		source: StoreError,
	},
}
