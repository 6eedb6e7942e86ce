//! Durable job/page/image/event state (SQLite via sqlx).
//!
//! Stores one row per job (keyed by the config fingerprint), per visited
//! page, per expanded image and per event. Worker transitions are batched
//! through a write buffer; resume reads only what has been flushed.

mod buffer;
mod db;
mod error;
mod events;
mod images;
mod jobs;
mod pages;
pub mod types;

pub use buffer::{Flusher, WriteOp};
pub(crate) use db::unix_timestamp;
pub use db::{StateStore, DEFAULT_FLUSH_INTERVAL, DEFAULT_FLUSH_ROWS};
pub use error::StoreError;
pub use jobs::OpenedJob;
pub use pages::Recovered;
pub use types::*;
