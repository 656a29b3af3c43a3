//! hopterm: a terminal emulator for local shells and SSH sessions,
//! including hops through a jump host with keyboard-interactive MFA.

pub mod auth;
pub mod config;
pub mod core;
pub mod ssh;
pub mod ui;
