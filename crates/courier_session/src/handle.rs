#![forbid(unsafe_code)]

use std::sync::Arc;

use courier_domain::{Message, RoomId, Timestamp, UserProfile};
use courier_store::{ChangeFeed, SendError, SendPipeline, SendRequest};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::driver::{SessionConfig, spawn_session_driver};
use crate::session::RoomSession;

/// A live, driven room subscription plus the send side for one user.
///
/// Dropping the handle tears the driver down immediately; other sessions on
/// the same room are unaffected.
pub struct SessionHandle {
	profile: UserProfile,
	room: RoomId,
	session: Arc<RwLock<RoomSession>>,
	pipeline: SendPipeline,
	driver: JoinHandle<()>,
}

impl SessionHandle {
	/// Open a session on `room`, subscribed from `from`.
	pub fn open(
		feed: ChangeFeed,
		pipeline: SendPipeline,
		profile: UserProfile,
		room: RoomId,
		from: Timestamp,
		cfg: SessionConfig,
	) -> Self {
		let session = Arc::new(RwLock::new(RoomSession::with_from(room.clone(), from)));
		let driver = spawn_session_driver(feed, Arc::clone(&session), cfg);

		Self {
			profile,
			room,
			session,
			pipeline,
			driver,
		}
	}

	pub fn profile(&self) -> &UserProfile {
		&self.profile
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	/// Shared session state, for presentation layers that poll it directly.
	pub fn session(&self) -> Arc<RwLock<RoomSession>> {
		Arc::clone(&self.session)
	}

	/// Copy of the current ordered view.
	pub async fn snapshot(&self) -> Vec<Message> {
		self.session.read().await.current_view().to_vec()
	}

	pub async fn set_draft(&self, text: impl Into<String>) {
		self.session.write().await.set_draft(text);
	}

	pub async fn draft(&self) -> String {
		self.session.read().await.draft().to_string()
	}

	/// Send a message as this session's user, under the profile's display
	/// name as it is right now.
	pub async fn send(&self, body: impl Into<String>) -> Result<Message, SendError> {
		self.pipeline
			.send(SendRequest::new(self.room.clone(), self.profile.display_name.clone(), body))
			.await
	}

	/// Send the draft buffer; it is cleared only when the whole pipeline
	/// succeeds, so a failed send leaves the text for the user to retry.
	pub async fn send_draft(&self) -> Result<Message, SendError> {
		let body = self.session.read().await.draft().to_string();
		let message = self.send(body).await?;
		self.session.write().await.clear_draft();
		Ok(message)
	}

	/// Tear the session down explicitly.
	pub fn close(self) {
		self.driver.abort();
	}
}

impl Drop for SessionHandle {
	fn drop(&mut self) {
		self.driver.abort();
	}
}
