#![forbid(unsafe_code)]

mod driver;
mod handle;
mod reconnect;
mod session;

pub use driver::{SessionConfig, spawn_session_driver};
pub use handle::SessionHandle;
pub use reconnect::resubscribe_delay;
pub use session::{Applied, RoomSession, SessionId};
