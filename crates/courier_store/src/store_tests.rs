#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use courier_domain::{MessageDraft, MessageId, Room, RoomId, Timestamp, UserId};

use crate::error::StoreError;
use crate::store::memory::{InMemoryStore, InMemoryStoreConfig};
use crate::store::{Appended, MessageStore};

fn room_id(s: &str) -> RoomId {
	RoomId::new(s).expect("valid RoomId")
}

fn user(s: &str) -> UserId {
	UserId::new(s).expect("valid UserId")
}

fn draft(id: &MessageId, sender: &str, body: &str) -> MessageDraft {
	MessageDraft::new(id.clone(), user(sender), "User", body)
}

async fn store_with_room(room: &str) -> InMemoryStore {
	let store = InMemoryStore::default();
	store
		.create_room(Room::new(room_id(room), [user("u1"), user("u2")]).expect("valid room"))
		.await
		.expect("create room");
	store
}

fn manual_clock(start_ms: i64) -> (Arc<AtomicI64>, Arc<dyn Fn() -> i64 + Send + Sync>) {
	let value = Arc::new(AtomicI64::new(start_ms));
	let handle = Arc::clone(&value);
	(value, Arc::new(move || handle.load(Ordering::Relaxed)))
}

#[tokio::test]
async fn append_assigns_strictly_increasing_positions() {
	let store = store_with_room("r1").await;
	let room = room_id("r1");

	let mut positions = Vec::new();
	for i in 0..5 {
		let id = MessageId::generate();
		let appended = store.append(&room, draft(&id, "u1", &format!("m{i}"))).await.expect("append");
		positions.push(appended.message().position());
	}

	for pair in positions.windows(2) {
		assert!(pair[0] < pair[1], "positions must be strictly increasing: {} vs {}", pair[0], pair[1]);
	}

	let listed = store.list_since(&room, Timestamp::ZERO).await.expect("list");
	assert_eq!(listed.len(), 5);
	let listed_positions: Vec<_> = listed.iter().map(|m| m.position()).collect();
	assert_eq!(listed_positions, positions);
}

#[tokio::test]
async fn frozen_clock_breaks_ties_by_seq() {
	let (_, clock) = manual_clock(1_000);
	let store = InMemoryStore::with_clock(InMemoryStoreConfig::default(), clock);
	let room = room_id("r1");
	store
		.create_room(Room::new(room.clone(), [user("u1"), user("u2")]).expect("valid room"))
		.await
		.expect("create room");

	for i in 0..3 {
		let id = MessageId::generate();
		store.append(&room, draft(&id, "u1", &format!("m{i}"))).await.expect("append");
	}

	let listed = store.list_since(&room, Timestamp::ZERO).await.expect("list");
	assert!(listed.iter().all(|m| m.created_at == Timestamp(1_000)));
	assert_eq!(listed.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
	assert_eq!(listed.iter().map(|m| m.body.as_str()).collect::<Vec<_>>(), vec!["m0", "m1", "m2"]);
}

#[tokio::test]
async fn clock_regression_never_moves_created_at_backwards() {
	let (clock_value, clock) = manual_clock(2_000);
	let store = InMemoryStore::with_clock(InMemoryStoreConfig::default(), clock);
	let room = room_id("r1");
	store
		.create_room(Room::new(room.clone(), [user("u1"), user("u2")]).expect("valid room"))
		.await
		.expect("create room");

	let first = store
		.append(&room, draft(&MessageId::generate(), "u1", "first"))
		.await
		.expect("append")
		.into_message();
	assert_eq!(first.created_at, Timestamp(2_000));

	clock_value.store(1_500, Ordering::Relaxed);
	let second = store
		.append(&room, draft(&MessageId::generate(), "u2", "second"))
		.await
		.expect("append")
		.into_message();

	assert_eq!(second.created_at, Timestamp(2_000));
	assert!(first.position() < second.position());
}

#[tokio::test]
async fn identical_retry_is_a_noop_success_and_emits_no_second_commit() {
	let store = store_with_room("r1").await;
	let room = room_id("r1");
	let id = MessageId::generate();

	let mut commits = store.subscribe_commits();

	let first = store.append(&room, draft(&id, "u1", "hello")).await.expect("append");
	assert!(first.is_new());

	let second = store.append(&room, draft(&id, "u1", "hello")).await.expect("retry");
	assert!(matches!(second, Appended::Deduplicated(_)));
	assert_eq!(second.message().position(), first.message().position());

	let listed = store.list_since(&room, Timestamp::ZERO).await.expect("list");
	assert_eq!(listed.len(), 1, "retry must not duplicate the message");

	assert!(commits.try_recv().is_ok(), "first append must commit");
	assert!(commits.try_recv().is_err(), "retry must not emit a second commit event");
}

#[tokio::test]
async fn differing_payload_for_same_id_is_a_conflict() {
	let store = store_with_room("r1").await;
	let room = room_id("r1");
	let id = MessageId::generate();

	store.append(&room, draft(&id, "u1", "hello")).await.expect("append");

	let err = store.append(&room, draft(&id, "u1", "tampered")).await.unwrap_err();
	assert!(matches!(err, StoreError::Conflict { .. }), "got: {err}");

	let err = store.append(&room, draft(&id, "u2", "hello")).await.unwrap_err();
	assert!(matches!(err, StoreError::Conflict { .. }), "got: {err}");
}

#[tokio::test]
async fn non_participants_cannot_append() {
	let store = store_with_room("r1").await;
	let room = room_id("r1");

	let err = store
		.append(&room, draft(&MessageId::generate(), "intruder", "hi"))
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::Unauthorized(_)), "got: {err}");
}

#[tokio::test]
async fn unknown_rooms_are_rejected() {
	let store = InMemoryStore::default();
	let room = room_id("nope");

	assert!(matches!(store.room(&room).await.unwrap_err(), StoreError::UnknownRoom(_)));
	assert!(matches!(
		store.list_since(&room, Timestamp::ZERO).await.unwrap_err(),
		StoreError::UnknownRoom(_)
	));
	assert!(matches!(
		store
			.append(&room, draft(&MessageId::generate(), "u1", "hi"))
			.await
			.unwrap_err(),
		StoreError::UnknownRoom(_)
	));
}

#[tokio::test]
async fn duplicate_room_creation_is_rejected() {
	let store = store_with_room("r1").await;
	let err = store
		.create_room(Room::new(room_id("r1"), [user("a"), user("b")]).expect("valid room"))
		.await
		.unwrap_err();
	assert!(matches!(err, StoreError::RoomExists(_)), "got: {err}");
}

#[tokio::test]
async fn latest_pointer_must_reference_a_stored_message() {
	let store = store_with_room("r1").await;
	let room = room_id("r1");

	let missing = MessageId::generate();
	let err = store.set_latest_message(&room, &missing).await.unwrap_err();
	assert!(matches!(err, StoreError::UnknownMessage { .. }), "got: {err}");
	assert_eq!(store.room(&room).await.expect("room").latest_message_id, None);

	let id = MessageId::generate();
	store.append(&room, draft(&id, "u1", "hi")).await.expect("append");
	store.set_latest_message(&room, &id).await.expect("set latest");
	assert_eq!(store.room(&room).await.expect("room").latest_message_id, Some(id));
}

#[tokio::test]
async fn list_since_is_inclusive_on_created_at() {
	let (clock_value, clock) = manual_clock(1_000);
	let store = InMemoryStore::with_clock(InMemoryStoreConfig::default(), clock);
	let room = room_id("r1");
	store
		.create_room(Room::new(room.clone(), [user("u1"), user("u2")]).expect("valid room"))
		.await
		.expect("create room");

	store
		.append(&room, draft(&MessageId::generate(), "u1", "early"))
		.await
		.expect("append");
	clock_value.store(2_000, Ordering::Relaxed);
	store
		.append(&room, draft(&MessageId::generate(), "u2", "late"))
		.await
		.expect("append");

	let at_boundary = store.list_since(&room, Timestamp(2_000)).await.expect("list");
	assert_eq!(at_boundary.len(), 1);
	assert_eq!(at_boundary[0].body, "late");

	let all = store.list_since(&room, Timestamp(1_000)).await.expect("list");
	assert_eq!(all.len(), 2);

	let none = store.list_since(&room, Timestamp(2_001)).await.expect("list");
	assert!(none.is_empty());
}

mod properties {
	use proptest::prelude::*;
	use proptest::test_runner::TestCaseError;

	use super::*;

	proptest! {
		#![proptest_config(ProptestConfig::with_cases(64))]

		#[test]
		fn appends_always_list_in_append_order(bodies in proptest::collection::vec("[a-z]{1,8}", 1..24)) {
			let rt = tokio::runtime::Builder::new_current_thread()
				.enable_all()
				.build()
				.expect("runtime");

			rt.block_on(async {
				let store = store_with_room("r1").await;
				let room = room_id("r1");

				let mut expected = Vec::with_capacity(bodies.len());
				for (i, body) in bodies.iter().enumerate() {
					let sender = if i % 2 == 0 { "u1" } else { "u2" };
					let id = MessageId::generate();
					let appended = store.append(&room, draft(&id, sender, body)).await.expect("append");
					expected.push(appended.into_message());
				}

				let listed = store.list_since(&room, Timestamp::ZERO).await.expect("list");
				prop_assert_eq!(&listed, &expected);

				for pair in listed.windows(2) {
					prop_assert!(pair[0].position() < pair[1].position());
				}
				Ok::<(), TestCaseError>(())
			})?;
		}
	}
}
