#![forbid(unsafe_code)]

mod error;

pub use error::*;

use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 1_000;
pub const DEFAULT_SNAPSHOT_CAPACITY: usize = 5_000;
pub const DEFAULT_SNAPSHOT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
pub const DEFAULT_RATE_LIMIT: u32 = 60; // requisições por janela
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(30);
