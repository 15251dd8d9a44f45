#![doc = include_str!("../Readme.md")]

pub mod app;
pub mod attempt;
pub mod attempt_manager;
pub mod config;
pub mod ethereum;
pub mod logging;
pub mod pool;
pub mod processor;
pub mod secret;
pub mod serde_utils;
pub mod shutdown;
pub mod signer;
pub mod store;
pub mod transaction;
pub mod utils;
