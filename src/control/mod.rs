//! Control path
//!
//! Short text or JSON messages from control clients, mainly "save a clip
//! named X". Every message gets an immediate reply; job completion is
//! pushed later to the session that asked for it.

pub mod manager;
pub mod message;

pub use manager::{ControlHandle, ControlSessionInfo, SessionManager};
pub use message::{parse_request, Ack, ControlReply, ControlRequest};
