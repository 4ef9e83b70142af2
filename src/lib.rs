//! Decentralized task auctions and map fusion for agents on a shared grid.

pub mod agent;
pub mod auction;
pub mod bus;
pub mod config;
pub mod cost;
pub mod error;
pub mod grid;
pub mod logging;
pub mod mailbox;
pub mod merge;
pub mod messages;
pub mod path;
pub mod peer_monitor;
pub mod perception;
pub mod sim;
pub mod tasks;
pub mod types;
pub mod world;

pub use error::{Error, Result};
