#![forbid(unsafe_code)]

use std::sync::Arc;

use courier_domain::{Message, MessageDraft, MessageId, RoomId};
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::{SendError, StoreError};
use crate::store::MessageStore;

/// An outgoing message before identity assignment.
#[derive(Debug, Clone)]
pub struct SendRequest {
	pub room_id: RoomId,
	pub sender_name: String,
	pub body: String,

	/// Pre-generated id for idempotent retries; `None` on first attempt.
	pub id: Option<MessageId>,
}

impl SendRequest {
	pub fn new(room_id: RoomId, sender_name: impl Into<String>, body: impl Into<String>) -> Self {
		Self {
			room_id,
			sender_name: sender_name.into(),
			body: body.into(),
			id: None,
		}
	}

	/// Retry an earlier attempt under the same identity.
	pub fn with_id(mut self, id: MessageId) -> Self {
		self.id = Some(id);
		self
	}
}

/// Two-step send: durable append, then the room's latest-message pointer.
///
/// The steps are deliberately not atomic; a failure between them leaves the
/// message durable and the pointer stale, repaired by `repair_latest` and
/// never by re-sending.
#[derive(Clone)]
pub struct SendPipeline {
	store: Arc<dyn MessageStore>,
	auth: Arc<dyn AuthProvider>,
}

impl SendPipeline {
	pub fn new(store: Arc<dyn MessageStore>, auth: Arc<dyn AuthProvider>) -> Self {
		Self { store, auth }
	}

	pub async fn send(&self, req: SendRequest) -> Result<Message, SendError> {
		if req.body.trim().is_empty() {
			return Err(SendError::InvalidInput("message body must be non-empty".to_string()));
		}

		let Some(sender_id) = self.auth.current_user_id() else {
			return Err(SendError::Unauthorized(req.room_id));
		};

		let id = req.id.unwrap_or_else(MessageId::generate);

		// Membership is rejected before the append is attempted.
		let room = match self.store.room(&req.room_id).await {
			Ok(room) => room,
			Err(StoreError::UnknownRoom(room)) => {
				return Err(SendError::InvalidInput(format!("unknown room {room}")));
			}
			Err(source) => return Err(SendError::PersistFailed { id, source }),
		};
		if !room.is_participant(&sender_id) {
			return Err(SendError::Unauthorized(req.room_id));
		}

		let draft = MessageDraft::new(id.clone(), sender_id, req.sender_name, req.body);
		let appended = match self.store.append(&req.room_id, draft).await {
			Ok(appended) => appended,
			Err(StoreError::Unauthorized(room)) => return Err(SendError::Unauthorized(room)),
			Err(StoreError::Conflict { room, id }) => {
				warn!(room = %room, id = %id, "send rejected: id collision with different payload");
				return Err(SendError::Conflict { room, id });
			}
			Err(StoreError::UnknownRoom(room)) => {
				return Err(SendError::InvalidInput(format!("unknown room {room}")));
			}
			Err(source) => return Err(SendError::PersistFailed { id, source }),
		};

		if appended.is_new() {
			metrics::counter!("courier_send_messages_total").increment(1);
		} else {
			debug!(room = %req.room_id, id = %id, "send retried against an already committed message");
		}

		let message = appended.into_message();
		if let Err(source) = self.store.set_latest_message(&req.room_id, &message.id).await {
			warn!(room = %req.room_id, id = %message.id, error = %source, "message persisted but latest pointer is stale");
			return Err(SendError::MetadataUpdateFailed {
				message: Box::new(message),
				source,
			});
		}

		Ok(message)
	}

	/// Corrective update for a stale latest-message pointer after
	/// `MetadataUpdateFailed`. Never re-sends the message body.
	pub async fn repair_latest(&self, room: &RoomId, id: &MessageId) -> Result<(), StoreError> {
		self.store.set_latest_message(room, id).await
	}
}
