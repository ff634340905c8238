//! The Kafka wire protocol, limited to what a console producer/consumer needs.
//!
//! # References
//! - <https://kafka.apache.org/protocol>

pub mod api_key;
pub mod api_version;
pub mod error;
pub mod frame;
pub mod messages;
pub mod primitives;
pub mod record;
pub mod traits;
mod vec_builder;
