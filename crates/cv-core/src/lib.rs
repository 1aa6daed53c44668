pub mod checkpoint;
pub mod config;
pub mod db;
pub mod dlq;
pub mod error;
pub mod event_log;
pub mod events;
pub mod graph;
pub mod projection;
pub mod task_store;
pub mod types;

pub use db::CoordDb;
pub use error::{CoordError, ErrorKind, Precondition, Result};
