//! WebSocket status streaming.
//!
//! Each connection follows one job and is closed by the server once the job
//! reaches a terminal state.

mod handler;

pub use handler::status_stream_handler;
