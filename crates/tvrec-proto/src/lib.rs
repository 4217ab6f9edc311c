pub mod config;
pub mod guide;
pub mod naming;
pub mod platform;
pub mod state;
