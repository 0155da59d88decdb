pub mod config;
pub mod error;
pub mod profile;
pub mod session;
pub mod state;
