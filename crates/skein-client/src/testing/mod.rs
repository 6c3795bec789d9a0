//! Testing utilities for skein-client.
//!
//! # Components
//!
//! - [`fixtures`]: Client configurations and sinks that cut test boilerplate
//! - [`mock_server`]: HTTP server speaking the ingestion API
//! - [`RecordingTransport`]: in-memory transport with scriptable failures

pub mod fixtures;
pub mod mock_server;

pub use crate::transport::RecordingTransport;
pub use fixtures::*;
pub use mock_server::MockIngestServer;
