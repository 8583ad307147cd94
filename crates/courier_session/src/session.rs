#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::fmt;

use courier_domain::{LogPosition, Message, MessageId, RoomId, Timestamp};
use courier_store::FeedItem;

/// Ephemeral subscriber identity, for log correlation only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// What applying a feed item did to the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
	Inserted,

	/// Already present (same id); at-least-once delivery, discarded.
	Duplicate,

	/// Not addressed to this session's room.
	Ignored,

	/// Lag marker; the view may be missing items until a resubscribe.
	Lagged { dropped: u64 },
}

/// Per-client, per-room subscription state: an ordered local view of the
/// conversation plus the position to resume from after a disconnect.
///
/// Not persisted; dies with the subscribing client context.
#[derive(Debug)]
pub struct RoomSession {
	id: SessionId,
	room: RoomId,
	from: Timestamp,
	view: Vec<Message>,
	seen: HashSet<MessageId>,
	last_applied: Option<LogPosition>,
	draft: String,
}

impl RoomSession {
	pub fn new(room: RoomId) -> Self {
		Self::with_from(room, Timestamp::ZERO)
	}

	/// Session that joins the conversation at `from`.
	pub fn with_from(room: RoomId, from: Timestamp) -> Self {
		Self {
			id: SessionId::new_v4(),
			room,
			from,
			view: Vec::new(),
			seen: HashSet::new(),
			last_applied: None,
			draft: String::new(),
		}
	}

	pub fn id(&self) -> SessionId {
		self.id
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	/// Fold a feed item into the view. Messages are inserted at their sorted
	/// position rather than appended: snapshot replay can deliver bursts out
	/// of order relative to what the session already holds.
	pub fn apply(&mut self, item: FeedItem) -> Applied {
		let message = match item {
			FeedItem::Added(message) => message,
			FeedItem::Lagged { dropped } => return Applied::Lagged { dropped },
		};

		if message.room_id != self.room {
			return Applied::Ignored;
		}

		if !self.seen.insert(message.id.clone()) {
			return Applied::Duplicate;
		}

		let position = message.position();
		let idx = self.view.partition_point(|m| m.position() <= position);
		self.view.insert(idx, *message);

		self.last_applied = Some(match self.last_applied {
			Some(last) if last > position => last,
			_ => position,
		});

		Applied::Inserted
	}

	/// The ordered view, ascending by position. Any inverted rendering is the
	/// presentation layer's business.
	pub fn current_view(&self) -> &[Message] {
		&self.view
	}

	pub fn len(&self) -> usize {
		self.view.len()
	}

	pub fn is_empty(&self) -> bool {
		self.view.is_empty()
	}

	pub fn last_applied(&self) -> Option<LogPosition> {
		self.last_applied
	}

	/// Timestamp to resubscribe from: last applied, else the original join
	/// point. Combined with id de-duplication this closes the replay gap.
	pub fn resume_from(&self) -> Timestamp {
		self.last_applied.map(|p| p.at).unwrap_or(self.from)
	}

	pub fn set_draft(&mut self, text: impl Into<String>) {
		self.draft = text.into();
	}

	pub fn draft(&self) -> &str {
		&self.draft
	}

	pub fn clear_draft(&mut self) {
		self.draft.clear();
	}
}

#[cfg(test)]
mod tests {
	use courier_domain::UserId;

	use super::*;

	fn room_id(s: &str) -> RoomId {
		RoomId::new(s).expect("valid RoomId")
	}

	fn msg(room: &str, id: &str, ms: i64, seq: u64, body: &str) -> Message {
		Message {
			id: MessageId::new(id).expect("valid MessageId"),
			room_id: room_id(room),
			sender_id: UserId::new("u1").expect("valid UserId"),
			sender_name: "User".to_string(),
			body: body.to_string(),
			created_at: Timestamp(ms),
			seq,
		}
	}

	fn added(m: Message) -> FeedItem {
		FeedItem::Added(Box::new(m))
	}

	#[test]
	fn out_of_order_bursts_end_up_sorted() {
		let mut session = RoomSession::new(room_id("r1"));

		session.apply(added(msg("r1", "c", 30, 3, "third")));
		session.apply(added(msg("r1", "a", 10, 1, "first")));
		session.apply(added(msg("r1", "b", 20, 2, "second")));

		let bodies: Vec<_> = session.current_view().iter().map(|m| m.body.as_str()).collect();
		assert_eq!(bodies, vec!["first", "second", "third"]);
		assert_eq!(session.last_applied(), Some(LogPosition::new(Timestamp(30), 3)));
	}

	#[test]
	fn same_timestamp_orders_by_seq() {
		let mut session = RoomSession::new(room_id("r1"));

		session.apply(added(msg("r1", "b", 10, 2, "second")));
		session.apply(added(msg("r1", "a", 10, 1, "first")));

		let bodies: Vec<_> = session.current_view().iter().map(|m| m.body.as_str()).collect();
		assert_eq!(bodies, vec!["first", "second"]);
	}

	#[test]
	fn duplicate_ids_are_discarded() {
		let mut session = RoomSession::new(room_id("r1"));

		assert_eq!(session.apply(added(msg("r1", "a", 10, 1, "hi"))), Applied::Inserted);
		assert_eq!(session.apply(added(msg("r1", "a", 10, 1, "hi"))), Applied::Duplicate);
		assert_eq!(session.len(), 1);
	}

	#[test]
	fn other_rooms_are_ignored() {
		let mut session = RoomSession::new(room_id("r1"));

		assert_eq!(session.apply(added(msg("r2", "a", 10, 1, "hi"))), Applied::Ignored);
		assert!(session.is_empty());
		assert_eq!(session.last_applied(), None);
	}

	#[test]
	fn lag_markers_pass_through_without_touching_the_view() {
		let mut session = RoomSession::new(room_id("r1"));
		session.apply(added(msg("r1", "a", 10, 1, "hi")));

		assert_eq!(session.apply(FeedItem::Lagged { dropped: 3 }), Applied::Lagged { dropped: 3 });
		assert_eq!(session.len(), 1);
	}

	#[test]
	fn resume_position_tracks_the_highest_applied_message() {
		let mut session = RoomSession::with_from(room_id("r1"), Timestamp(5));
		assert_eq!(session.resume_from(), Timestamp(5));

		session.apply(added(msg("r1", "b", 20, 2, "later")));
		session.apply(added(msg("r1", "a", 10, 1, "earlier")));

		// Out-of-order application must not move the resume point backwards.
		assert_eq!(session.resume_from(), Timestamp(20));
	}

	#[test]
	fn draft_buffer_round_trip() {
		let mut session = RoomSession::new(room_id("r1"));
		assert_eq!(session.draft(), "");

		session.set_draft("hello th");
		assert_eq!(session.draft(), "hello th");

		session.clear_draft();
		assert_eq!(session.draft(), "");
	}
}
