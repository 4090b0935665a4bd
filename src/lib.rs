//! Parental access-control enforcement.
//!
//! Blocks websites by dropping packets to their addresses, terminates
//! blocked applications, and charges each child profile's daily screen-time
//! budget, locking the screen when it runs out. [`engine::Engine`] is the
//! entry point; everything it talks to is behind a trait so [`mock`]
//! collaborators can stand in for the operating system.

pub mod config;
pub mod enforcement;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod mock;
pub mod notify;
pub mod platform;
pub mod policy;
pub mod state;
pub mod time_limits;
