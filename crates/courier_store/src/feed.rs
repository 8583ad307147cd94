#![forbid(unsafe_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use courier_domain::{LogPosition, Message, RoomId, Timestamp};
use tokio::sync::{Mutex, broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::store::{MessageStore, StoreEvent};

/// Items emitted on a subscriber stream.
#[derive(Debug, Clone)]
pub enum FeedItem {
	Added(Box<Message>),

	/// Indicates the subscriber fell behind and items were dropped; recover
	/// by resubscribing from the last applied timestamp.
	Lagged { dropped: u64 },
}

/// Configuration for `FeedHub`.
#[derive(Debug, Clone)]
pub struct FeedHubConfig {
	/// Maximum number of queued items per subscriber.
	pub subscriber_queue_capacity: usize,

	pub debug_logs: bool,
}

impl Default for FeedHubConfig {
	fn default() -> Self {
		Self {
			subscriber_queue_capacity: 1024,
			debug_logs: false,
		}
	}
}

/// Per-room hub that fans out committed messages to live subscribers.
#[derive(Debug, Clone)]
pub struct FeedHub {
	inner: Arc<Mutex<HubInner>>,
	cfg: FeedHubConfig,
}

#[derive(Debug, Default)]
struct HubInner {
	rooms: HashMap<RoomId, RoomEntry>,
}

#[derive(Debug, Default)]
struct RoomEntry {
	subscribers: Vec<mpsc::Sender<FeedItem>>,

	/// Pending lag markers per subscriber.
	pending_lag_by_subscriber: Vec<u64>,
}

impl FeedHub {
	pub fn new(cfg: FeedHubConfig) -> Self {
		Self {
			inner: Arc::new(Mutex::new(HubInner::default())),
			cfg,
		}
	}

	/// Register a live subscriber for a room.
	pub async fn subscribe_room(&self, room: RoomId) -> mpsc::Receiver<FeedItem> {
		let (tx, rx) = mpsc::channel(self.cfg.subscriber_queue_capacity);

		let mut inner = self.inner.lock().await;
		let entry = inner.rooms.entry(room.clone()).or_default();

		prune_closed_subscribers(entry);

		entry.subscribers.push(tx);
		entry.pending_lag_by_subscriber.push(0);

		if self.cfg.debug_logs {
			debug!(room = %room, subs = entry.subscribers.len(), "feed hub: subscribed");
		}

		rx
	}

	/// Drop bookkeeping for closed subscribers of a room.
	pub async fn prune_room(&self, room: &RoomId) {
		let mut inner = self.inner.lock().await;
		if let Some(entry) = inner.rooms.get_mut(room) {
			prune_closed_subscribers(entry);

			if entry.subscribers.is_empty() {
				inner.rooms.remove(room);
			}
		}
	}

	/// Publish an item to every live subscriber of `room`.
	pub async fn publish(&self, room: &RoomId, item: FeedItem) {
		let mut inner = self.inner.lock().await;
		let Some(entry) = inner.rooms.get_mut(room) else {
			return;
		};

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
			return;
		}

		let mut dropped_total: u64 = 0;

		for (idx, sub) in entry.subscribers.iter_mut().enumerate() {
			match sub.try_send(item.clone()) {
				Ok(()) => {
					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx)
						&& *pending > 0 && sub.try_send(FeedItem::Lagged { dropped: *pending }).is_ok()
					{
						*pending = 0;
					}
				}
				Err(mpsc::error::TrySendError::Full(_)) => {
					dropped_total += 1;

					if let Some(pending) = entry.pending_lag_by_subscriber.get_mut(idx) {
						*pending = pending.saturating_add(1);
					}
				}
				Err(mpsc::error::TrySendError::Closed(_)) => {}
			}
		}

		prune_closed_subscribers(entry);

		if entry.subscribers.is_empty() {
			inner.rooms.remove(room);
		}

		if dropped_total > 0 {
			metrics::counter!("courier_feed_items_dropped_total").increment(dropped_total);
			if self.cfg.debug_logs {
				debug!(room = %room, dropped = dropped_total, "feed hub: dropped due to full subscriber queues");
			}
		}
	}

	/// Snapshot of live subscriber counts per room.
	pub async fn subscriber_counts(&self) -> HashMap<RoomId, usize> {
		let inner = self.inner.lock().await;
		inner
			.rooms
			.iter()
			.map(|(k, v)| (k.clone(), v.subscribers.iter().filter(|s| !s.is_closed()).count()))
			.collect()
	}
}

fn prune_closed_subscribers(entry: &mut RoomEntry) {
	if entry.subscribers.len() != entry.pending_lag_by_subscriber.len() {
		entry.pending_lag_by_subscriber.resize(entry.subscribers.len(), 0);
	}

	let subscribers = std::mem::take(&mut entry.subscribers);
	let pending = std::mem::take(&mut entry.pending_lag_by_subscriber);

	for (sub, lag) in subscribers.into_iter().zip(pending) {
		if !sub.is_closed() {
			entry.subscribers.push(sub);
			entry.pending_lag_by_subscriber.push(lag);
		}
	}
}

/// Configuration for `ChangeFeed`.
#[derive(Debug, Clone, Default)]
pub struct ChangeFeedConfig {
	pub hub: FeedHubConfig,

	pub debug_log_events: bool,
}

/// Push mechanism delivering store mutations to room subscribers.
///
/// A background router consumes the store commit stream and republishes
/// into the per-room hub; `subscribe` stitches a snapshot read together
/// with a live subscription so resuming consumers see no gaps.
#[derive(Clone)]
pub struct ChangeFeed {
	hub: FeedHub,
	store: Arc<dyn MessageStore>,
}

impl ChangeFeed {
	/// Start the feed over a store, spawning the commit router.
	pub fn start(store: Arc<dyn MessageStore>, cfg: ChangeFeedConfig) -> Self {
		let hub = FeedHub::new(cfg.hub.clone());
		let commits = store.subscribe_commits();
		tokio::spawn(route_commits(commits, hub.clone(), cfg));

		Self { hub, store }
	}

	/// Subscribe to a room from `from` (inclusive): replays the snapshot at
	/// or after that timestamp, then yields live additions. Items already
	/// yielded are filtered by position, so the stream is ascending; callers
	/// still de-duplicate by id across their own resubscriptions.
	pub async fn subscribe(&self, room: &RoomId, from: Timestamp) -> Result<FeedSubscription, StoreError> {
		// Live registration happens before the snapshot read; anything the
		// snapshot misses is already queued on the live channel.
		let live = self.hub.subscribe_room(room.clone()).await;
		let snapshot = self.store.list_since(room, from).await?;

		if self.hub.cfg.debug_logs {
			debug!(room = %room, from = %from, snapshot = snapshot.len(), "change feed: subscription created");
		}

		Ok(FeedSubscription {
			snapshot: snapshot.into(),
			live,
			from,
			high_water: None,
		})
	}

	/// The underlying hub (subscriber accounting).
	pub fn hub(&self) -> &FeedHub {
		&self.hub
	}
}

async fn route_commits(mut commits: broadcast::Receiver<StoreEvent>, hub: FeedHub, cfg: ChangeFeedConfig) {
	info!("change feed router started");

	loop {
		let event = match commits.recv().await {
			Ok(ev) => ev,
			Err(broadcast::error::RecvError::Lagged(n)) => {
				warn!(
					lagged = n,
					"change feed router lagged on the commit stream; subscribers recover by resubscribing"
				);
				continue;
			}
			Err(broadcast::error::RecvError::Closed) => {
				info!("change feed router exiting (commit stream closed)");
				break;
			}
		};

		match event {
			StoreEvent::Added(message) => {
				if cfg.debug_log_events {
					debug!(room = %message.room_id, id = %message.id, "routing committed message to feed hub");
				}

				metrics::counter!("courier_feed_items_published_total").increment(1);
				let room = message.room_id.clone();
				hub.publish(&room, FeedItem::Added(Box::new(message))).await;
			}
			// The log is immutable; mutation events from the underlying
			// store are ignored rather than forwarded.
			StoreEvent::Modified(message) => {
				debug!(room = %message.room_id, id = %message.id, "ignoring modify event for immutable log");
			}
			StoreEvent::Removed { room, id } => {
				debug!(room = %room, id = %id, "ignoring remove event for immutable log");
			}
		}
	}
}

/// A single room subscription: snapshot replay followed by live additions.
///
/// Infinite and not restartable; drop it to cancel, and create a new
/// subscription to replay from a different point.
#[derive(Debug)]
pub struct FeedSubscription {
	snapshot: VecDeque<Message>,
	live: mpsc::Receiver<FeedItem>,
	from: Timestamp,
	high_water: Option<LogPosition>,
}

impl FeedSubscription {
	/// Next item, or `None` once the feed side has gone away.
	pub async fn next(&mut self) -> Option<FeedItem> {
		if let Some(message) = self.snapshot.pop_front() {
			self.high_water = Some(message.position());
			return Some(FeedItem::Added(Box::new(message)));
		}

		loop {
			match self.live.recv().await? {
				FeedItem::Added(message) => {
					// Older than the subscription's replay point: routed into
					// the live queue while the snapshot was being taken.
					if message.created_at < self.from {
						continue;
					}

					// Live items at or below the high-water position were
					// already yielded by the snapshot.
					if let Some(hw) = self.high_water
						&& message.position() <= hw
					{
						continue;
					}

					self.high_water = Some(message.position());
					return Some(FeedItem::Added(message));
				}
				lagged @ FeedItem::Lagged { .. } => return Some(lagged),
			}
		}
	}

	/// Position of the last yielded message, if any.
	pub fn high_water(&self) -> Option<LogPosition> {
		self.high_water
	}
}
