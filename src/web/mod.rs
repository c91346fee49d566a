mod control_ws;
mod handlers;
mod media_ws;
mod routes;
mod ws;

pub use control_ws::control_ws_handler;
pub use media_ws::{audio_ws_handler, video_ws_handler, WsSink};
pub use routes::create_router;
pub use ws::ws_handler;
