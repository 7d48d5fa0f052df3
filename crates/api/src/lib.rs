pub mod config;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod response;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;
