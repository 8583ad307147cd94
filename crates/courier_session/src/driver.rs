#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use courier_store::{ChangeFeed, FeedItem, StoreError};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::reconnect::resubscribe_delay;
use crate::session::RoomSession;

/// Settings for the session driver.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	/// Resubscribe backoff minimum delay.
	pub resubscribe_min_delay: Duration,

	/// Resubscribe backoff cap.
	pub resubscribe_max_delay: Duration,

	/// A subscription healthy for this long resets the backoff counter.
	pub resubscribe_reset_after: Duration,
}

impl Default for SessionConfig {
	fn default() -> Self {
		Self {
			resubscribe_min_delay: Duration::from_millis(500),
			resubscribe_max_delay: Duration::from_secs(30),
			resubscribe_reset_after: Duration::from_secs(60 * 5),
		}
	}
}

/// Spawn a background task that keeps `session` fed from the change feed.
///
/// Subscription loss and lag markers are handled by resubscribing from the
/// session's last applied timestamp; only an unknown room is fatal.
pub fn spawn_session_driver(feed: ChangeFeed, session: Arc<RwLock<RoomSession>>, cfg: SessionConfig) -> JoinHandle<()> {
	tokio::spawn(drive_session(feed, session, cfg))
}

async fn drive_session(feed: ChangeFeed, session: Arc<RwLock<RoomSession>>, cfg: SessionConfig) {
	let (session_id, room) = {
		let s = session.read().await;
		(s.id(), s.room().clone())
	};

	let mut attempt: u32 = 0;

	loop {
		let from = session.read().await.resume_from();

		let mut sub = match feed.subscribe(&room, from).await {
			Ok(sub) => sub,
			Err(StoreError::UnknownRoom(_)) => {
				warn!(session = %session_id, room = %room, "session driver exiting: room does not exist");
				return;
			}
			Err(e) => {
				attempt = attempt.saturating_add(1);
				let delay = resubscribe_delay(cfg.resubscribe_min_delay, cfg.resubscribe_max_delay, attempt);
				warn!(
					session = %session_id,
					room = %room,
					error = %e,
					attempt,
					delay_ms = delay.as_millis() as u64,
					"subscribe failed; retrying"
				);
				tokio::time::sleep(delay).await;
				continue;
			}
		};

		debug!(session = %session_id, room = %room, from = %from, "session subscribed");
		let subscribed_at = Instant::now();

		while let Some(item) = sub.next().await {
			match item {
				FeedItem::Lagged { dropped } => {
					warn!(
						session = %session_id,
						room = %room,
						dropped,
						"session lagged; resubscribing from last applied timestamp"
					);
					break;
				}
				item => {
					session.write().await.apply(item);
				}
			}
		}

		// Lagged or the feed side went away; either way the replay +
		// resubscribe path recovers without data loss.
		metrics::counter!("courier_session_resubscribes_total").increment(1);

		// A long healthy subscription starts the backoff schedule over.
		if subscribed_at.elapsed() >= cfg.resubscribe_reset_after {
			attempt = 0;
		}
		attempt = attempt.saturating_add(1);

		let delay = resubscribe_delay(cfg.resubscribe_min_delay, cfg.resubscribe_max_delay, attempt);
		debug!(
			session = %session_id,
			room = %room,
			attempt,
			delay_ms = delay.as_millis() as u64,
			"scheduling resubscribe"
		);
		tokio::time::sleep(delay).await;
	}
}
