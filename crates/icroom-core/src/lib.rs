// Shared building blocks for the debate room: data model, persistence,
// configuration, wire protocol and the WebSocket listener.

pub mod agent;
pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod notify;
pub mod protocol;
pub mod store;
pub mod ws_server;
