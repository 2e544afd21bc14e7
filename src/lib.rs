//! iPowerUp Link library
//! Talks to iPowerUp battery cases over BLE: discovery, connection,
//! the command protocol and status decoding.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
