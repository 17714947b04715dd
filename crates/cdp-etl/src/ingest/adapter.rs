//! Source adapter trait
//!
//! Implement this trait for every upstream the pipeline pulls from. The cursor
//! is opaque to the rest of the pipeline: only the adapter that produced it
//! knows what it means.

use crate::error::EtlResult;
use crate::ingest::types::{FetchedBatch, NormalizedRecord, RawRecord};
use async_trait::async_trait;
use std::collections::BTreeSet;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Source name, also the checkpoint key
    fn name(&self) -> &str;

    /// Fetch the records that follow `cursor` (`None` means from the start).
    ///
    /// Transient upstream problems must surface as
    /// [`EtlError::TransientFetch`](crate::error::EtlError::TransientFetch) so
    /// the runner can retry them.
    async fn fetch(&self, cursor: Option<&str>) -> EtlResult<FetchedBatch>;

    /// Map one raw record into the unified schema.
    ///
    /// A record that cannot be mapped yields
    /// [`EtlError::Validation`](crate::error::EtlError::Validation) and is skipped.
    fn normalize(&self, raw: &RawRecord) -> EtlResult<NormalizedRecord>;

    /// Field names a well-formed raw record carries
    fn expected_schema(&self) -> BTreeSet<String>;
}
