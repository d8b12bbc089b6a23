//! Bulk waveform delivery for the dataselect service.
//!
//! [`plan_streams`] resolves a request into (stream, window) pairs using the
//! extent index and access rules. A [`DeliveryPipeline`] then pulls raw
//! miniSEED blocks for each pair from a [`RecordSource`] on the blocking
//! pool and writes them, in order, to a flow-controlled [`ByteSink`].

mod error;
pub mod mseed;
mod pipeline;
mod plan;
mod sink;
mod source;

pub use error::DeliveryError;
pub use pipeline::{
    Action, DeliveryOutcome, DeliveryPipeline, Event, FetchPool, Machine, PipelineState,
    DEFAULT_CHUNK_SIZE,
};
pub use plan::{attachment_name, plan_streams, PlanLimits, StreamRequest};
pub use sink::{ByteSink, ChannelSink, Flow, SinkClosed, SinkSignal};
pub use source::{MemoryRecordSource, RecordReader, RecordSource, SdsRecordSource};
