//! A console tool to produce to and consume from an Apache Kafka cluster.
//!
//! The [`client`] module holds a small async Kafka client: a metadata-aware broker pool,
//! per-partition produce/fetch/offset requests, a keyed producer and a partition consumer.
//! The [`cli`] module builds the `kafka-cli` binary on top of it.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod backoff;
pub mod build_info;
pub mod cli;
pub mod client;
pub mod connection;
pub mod messenger;
pub mod protocol;
pub mod record;
mod throttle;
pub mod topic;
mod validation;
