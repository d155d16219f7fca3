//! DNS record sink.
//!
//! The controller only decides *which* record operation a notification
//! calls for.  Where the records live is up to the [`RecordSink`]
//! implementation.

use anyhow::Result;
use async_trait::async_trait;
use log::info;

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Publish a record derived from `instance_name` pointing at `floating_ip`.
    async fn create_record(&self, instance_name: &str, floating_ip: &str) -> Result<()>;

    /// Remove whatever record currently points at `floating_ip`.
    ///
    /// Detach notifications carry neither a port nor a fixed IP, so the
    /// address is the only key available.
    async fn remove_record(&self, floating_ip: &str) -> Result<()>;
}

/// Sink that only logs the requested operations.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogRecordSink;

#[async_trait]
impl RecordSink for LogRecordSink {
    async fn create_record(&self, instance_name: &str, floating_ip: &str) -> Result<()> {
        info!(
            "Not implemented: Creating record '{}' for address {}",
            instance_name, floating_ip
        );
        Ok(())
    }

    async fn remove_record(&self, floating_ip: &str) -> Result<()> {
        info!("Not implemented: Deleting record for address '{}'", floating_ip);
        Ok(())
    }
}
