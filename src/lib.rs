//! Resumable, parallel extraction of per-scope relations from compressed JSONL
//! shards of an OpenAlex snapshot, followed by consolidation into one dataset
//! per scope.

pub mod aggregate;
pub mod config;
pub mod dispatch;
pub mod gate;
pub mod pipeline;
pub mod record;
pub mod reference;
pub mod retry;
pub mod scope;
pub mod shards;
pub mod sink;
pub mod transform;
pub mod util;
pub mod worker;

pub use aggregate::{AggregationResult, Aggregator};
pub use config::RunConfig;
pub use dispatch::{DispatchReport, Dispatcher};
pub use gate::IdempotencyGate;
pub use pipeline::{Pipeline, RunSummary};
pub use reference::{ReferenceIdSet, ReferenceTable, YearBucketedIds};
pub use retry::RetryPolicy;
pub use scope::Scope;
pub use shards::{ShardEnumerator, ShardHandle};
pub use transform::RecordTransform;
pub use worker::ShardWorker;
