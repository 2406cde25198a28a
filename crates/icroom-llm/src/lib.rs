// Claude-backed agent generation for debate sessions.

pub mod agent;
pub mod client;
pub mod prompt;
