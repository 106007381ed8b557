//! Common test infrastructure
//!
//! Tests should only import from this module, not from internal submodules.

#![allow(dead_code)]

mod server;

use std::time::Duration;

use e621dl::e621::{ClientConfig, E621Client};

pub use server::{file_body, MockBoard, MockPost, RecordedRequest};

/// A client pointed at `board` with no spacing and fast retries.
pub fn client_for(board: &MockBoard) -> E621Client {
    E621Client::new(test_config(board)).expect("Failed to build client")
}

pub fn test_config(board: &MockBoard) -> ClientConfig {
    ClientConfig {
        base_url: board.base_url.clone(),
        min_interval: Duration::ZERO,
        retry_attempts: 5,
        retry_backoff: Duration::from_millis(5),
        timeout: Duration::from_secs(10),
        ..ClientConfig::default()
    }
}
