//! # logvault
//!
//! An asynchronous, batched log-shipping pipeline that persists structured log records to
//! a relational sink (SQLite or PostgreSQL) without blocking the code that emits them.
//!
//! ## Architecture
//!
//! - [`buffer`]: unbounded multi-producer queue between emitters and the processor
//! - [`provision`]: startup creation of the log schema and table
//! - [`processor`]: drains the queue into batches and writes them with retry
//! - [`connection`]: resolves the sink connection string on every write attempt
//! - [`emitter`]: `LogEmitter` handle and the `tracing` layer feeding the queue
//! - [`pipeline`]: startup ordering and the running pipeline handle
//!
//! Supporting modules cover the SQL dialects ([`database`]), restart supervision
//! ([`worker`]), shutdown signalling ([`shutdown`]), and process configuration ([`env`]).

pub mod buffer;
pub mod cli;
pub mod connection;
pub mod database;
pub mod emitter;
pub mod env;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod processor;
pub mod provision;
pub mod record;
pub mod shutdown;
pub mod worker;
