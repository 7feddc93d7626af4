//! Client runtime: reconciled room history plus a single live session.

pub mod cache;
pub mod history;
pub mod room;
pub mod session;

pub use cache::{ReconciliationCache, merge_messages, same_event};
pub use history::HistoryClient;
pub use room::RoomView;
pub use session::{LiveSession, SessionManager};
