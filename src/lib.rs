//! Pdfer Conversion Service Library
//!
//! Converts uploaded office documents to PDF through a single LibreOffice
//! instance driven by unoconv. The engine crashes under concurrent use and
//! sometimes on its own, so all work is serialized through one queue and the
//! engine listener is supervised and relaunched after every crash.
//!
//! ## Module Overview
//!
//! - `queue`: FIFO queue with a single busy slot and debounced drain
//! - `converter`: engine client for one job, with crash isolation
//! - `retry`: bounded retry decisions (permanent vs transient failures)
//! - `engine`: listener supervision, orphan sweep and relaunch
//! - `job`: job model and one-shot completion handle
//! - `server`: HTTP upload, status and reset endpoints
//! - `telemetry`: OpenTelemetry integration and structured logging
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use pdfer::{
//!     converter::UnoconvConverter,
//!     queue::ConversionQueue,
//!     retry::RetryPolicy,
//! };
//! use std::path::PathBuf;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let converter = UnoconvConverter::new(vec!["unoconv".to_string()], 8085);
//!     let queue = ConversionQueue::new(Arc::new(converter), RetryPolicy::default());
//!
//!     let outcome = queue
//!         .convert(PathBuf::from("/tmp/report.docx"), PathBuf::from("/tmp/report.pdf"))
//!         .await;
//!     println!("{:?}", outcome);
//! }
//! ```

pub mod config;
pub mod converter;
pub mod engine;
pub mod error;
pub mod formats;
pub mod job;
pub mod queue;
pub mod retry;
pub mod server;
pub mod telemetry;
