//! Tributary: a transactional change-data-capture migration pipeline.
//!
//! Tributary mirrors a source relational database into a target relational
//! schema by consuming a topic-partitioned log of row-level change events,
//! reassembling whole transactions in commit order, classifying each
//! transaction into a semantic action, and replaying every action as a
//! single target-database transaction.
//!
//! The crate is organized along the dataflow:
//! - [`extract`] merges the two log topics into ordered transactions
//! - [`actions`] fingerprints each transaction and projects typed payloads
//! - [`load`] applies payloads transactionally, checkpoint included
//! - [`state`] carries cross-transaction facts with commit-scoped writes
//! - [`pipeline`] is the single-threaded driver tying the stages together

pub mod actions;
pub mod config;
pub mod events;
pub mod extract;
pub mod load;
pub mod logging;
pub mod pipeline;
pub mod schema;
pub mod state;
pub mod utils;
