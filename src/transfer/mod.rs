//! The transfer pipeline: jobs, the per-owner registry, and the relay that
//! moves a file from the chat platform to object storage.

mod error;
mod job;
mod registry;
mod relay;

pub use error::{Rejection, TransferError};
pub use job::{Job, JobId, JobSnapshot, OwnerId, Phase};
pub use registry::{CancelOutcome, JobRegistry};
pub use relay::{
    object_key, Accepted, Delivery, JobOutcome, Relay, RelaySettings, UploadRequest,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

pub type ByteStream = BoxStream<'static, Result<Bytes, TransferError>>;

/// Where an inbound file's bytes come from.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn open(&self) -> Result<ByteStream, TransferError>;
}
