//! Local JSONL transport for offline use.

use std::sync::Arc;

use async_trait::async_trait;
use skein_trace::{CallLogWriter, CallOp, WriterConfig};

use super::{EntryOutcome, Transport};
use crate::error::{ClientError, Result};

/// Appends every batch to a call log and accepts every entry.
#[derive(Debug, Clone)]
pub struct FileTransport {
    writer: Arc<CallLogWriter>,
}

impl FileTransport {
    pub fn new(config: WriterConfig) -> Result<Self> {
        Ok(Self {
            writer: Arc::new(CallLogWriter::new(config)?),
        })
    }

    pub fn writer(&self) -> &CallLogWriter {
        &self.writer
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn send(&self, batch: &[CallOp]) -> Result<Vec<EntryOutcome>> {
        let writer = Arc::clone(&self.writer);
        let batch = batch.to_vec();
        let len = batch.len();

        tokio::task::spawn_blocking(move || writer.write_batch(&batch))
            .await
            .map_err(|e| ClientError::Internal(format!("Call log task failed: {}", e)))??;

        Ok(vec![EntryOutcome::accepted(); len])
    }

    fn name(&self) -> &str {
        "file"
    }
}
