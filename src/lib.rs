pub mod activity;
pub mod actuator;
pub mod config;
pub mod error;
pub mod geometry;
pub mod monitor;
pub mod notify;
pub mod posture;
pub mod presence;
pub mod session;
pub mod source;
pub mod store;
