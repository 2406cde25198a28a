pub mod app;
pub mod gateway;
pub mod hub;
pub mod presence;
