//! Backpressure-aware delivery of raw records to a [`ByteSink`].
//!
//! The control flow is split in two. [`Machine`] is a pure transition
//! function over [`PipelineState`]; [`DeliveryPipeline::run`] is the
//! dispatch loop that feeds it events (fetch results, sink signals) and
//! carries out the actions it returns. Fetches run on the blocking pool,
//! one at a time per pipeline; writes happen only on the dispatch loop.

use std::collections::VecDeque;
use std::sync::Arc;

use seisws_track::{TrackStatus, TrackingSink};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::DeliveryError;
use crate::mseed::rewrite_network;
use crate::plan::StreamRequest;
use crate::sink::{ByteSink, Flow, SinkSignal};
use crate::source::{RecordReader, RecordSource};

/// Block size a fetch aims for before handing bytes to the sink.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

const NO_WAVEFORMS: &str = "no waveform data found";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Fetching,
    Flushing,
    Paused,
    Finished,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// Start, or the sink has room again.
    Resume,
    /// The sink asked to hold writes.
    Pause,
    BlockReady,
    Exhausted,
    Failed,
    Flushed,
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    ScheduleFetch,
    Flush,
    Finish,
    Cancel,
}

/// Delivery state plus the sink's pause flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    state: PipelineState,
    paused: bool,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            state: PipelineState::Idle,
            paused: false,
        }
    }
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Applies `event` and returns what the dispatch loop must do next.
    ///
    /// At most one fetch is ever scheduled between two results: a resume
    /// while a fetch is in flight only clears the pause flag.
    pub fn handle(&mut self, event: Event) -> Action {
        use PipelineState::*;

        if self.state.is_terminal() {
            return Action::None;
        }

        match (self.state, event) {
            (_, Event::Disconnect) => {
                self.state = Cancelled;
                Action::Cancel
            }
            (_, Event::Pause) => {
                self.paused = true;
                Action::None
            }
            (Idle | Paused, Event::Resume) => {
                self.paused = false;
                self.state = Fetching;
                Action::ScheduleFetch
            }
            (Fetching | Flushing, Event::Resume) => {
                self.paused = false;
                Action::None
            }
            (Fetching, Event::BlockReady) => {
                self.state = Flushing;
                Action::Flush
            }
            (Fetching, Event::Exhausted | Event::Failed) => {
                self.state = Finished;
                Action::Finish
            }
            (Flushing, Event::Flushed) if self.paused => {
                self.state = Paused;
                Action::None
            }
            (Flushing, Event::Flushed) => {
                self.state = Fetching;
                Action::ScheduleFetch
            }
            (state, event) => {
                tracing::trace!(?state, ?event, "event ignored");
                Action::None
            }
        }
    }
}

/// How a delivery ended.
#[derive(Debug)]
pub enum DeliveryOutcome {
    Completed { bytes: u64 },
    NoData,
    Cancelled { bytes: u64 },
    /// The source failed; `bytes` were delivered before that.
    Failed { bytes: u64, error: DeliveryError },
}

impl DeliveryOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Completed { bytes } | Self::Cancelled { bytes } | Self::Failed { bytes, .. } => {
                *bytes
            }
            Self::NoData => 0,
        }
    }
}

/// Bounded pool of blocking fetch workers shared by every pipeline.
#[derive(Debug, Clone)]
pub struct FetchPool {
    permits: Arc<Semaphore>,
}

impl FetchPool {
    pub fn new(workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    fn spawn<T, F>(&self, job: F) -> JoinHandle<Result<T, DeliveryError>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        tokio::spawn(async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| DeliveryError::Worker(e.to_string()))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                job()
            })
            .await
            .map_err(|e| DeliveryError::Worker(e.to_string()))
        })
    }
}

enum Fetched {
    Block(Vec<u8>),
    Exhausted,
    Failed(DeliveryError),
}

struct OpenStream {
    request: StreamRequest,
    reader: Box<dyn RecordReader>,
    bytes: u64,
}

/// Worker-side state: moved into each fetch and handed back with the result.
struct StreamCursor {
    source: Arc<dyn RecordSource>,
    pending: VecDeque<StreamRequest>,
    current: Option<OpenStream>,
    chunk_size: usize,
    tracker: Arc<dyn TrackingSink>,
}

impl StreamCursor {
    /// Next block of the current stream. A block never spans two streams.
    fn fetch(&mut self) -> Fetched {
        loop {
            let Some(open) = self.current.as_mut() else {
                let Some(request) = self.pending.pop_front() else {
                    return Fetched::Exhausted;
                };
                match self.source.open(&request) {
                    Ok(reader) => {
                        self.current = Some(OpenStream {
                            request,
                            reader,
                            bytes: 0,
                        })
                    }
                    Err(err) => {
                        self.tracker
                            .line_status(&request.line(TrackStatus::Error, 0));
                        return Fetched::Failed(err);
                    }
                }
                continue;
            };

            match open.reader.next_block(self.chunk_size) {
                Ok(Some(mut block)) => {
                    if open.request.needs_rewrite() {
                        if let Err(err) = rewrite_network(&mut block, &open.request.stream.network)
                        {
                            tracing::error!(
                                stream = %open.request.stream,
                                error = %err,
                                "network rewrite failed"
                            );
                            self.tracker
                                .line_status(&open.request.line(TrackStatus::Error, open.bytes));
                            return Fetched::Failed(DeliveryError::Codec(err));
                        }
                    }
                    open.bytes += block.len() as u64;
                    return Fetched::Block(block);
                }
                Ok(None) => {
                    let status = if open.bytes > 0 {
                        TrackStatus::Ok
                    } else {
                        TrackStatus::NoData
                    };
                    self.tracker
                        .line_status(&open.request.line(status, open.bytes));
                    self.current = None;
                }
                Err(err) => {
                    self.tracker
                        .line_status(&open.request.line(TrackStatus::Error, open.bytes));
                    return Fetched::Failed(err);
                }
            }
        }
    }
}

enum Woken {
    Signal(Option<SinkSignal>),
    Fetch(Result<Result<(StreamCursor, Fetched), DeliveryError>, tokio::task::JoinError>),
    Stalled,
}

async fn join<T>(handle: &mut Option<JoinHandle<T>>) -> Result<T, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

/// Streams a list of (stream, window) requests to a sink.
pub struct DeliveryPipeline {
    source: Arc<dyn RecordSource>,
    pool: FetchPool,
    chunk_size: usize,
    tracker: Arc<dyn TrackingSink>,
}

impl DeliveryPipeline {
    pub fn new(
        source: Arc<dyn RecordSource>,
        pool: FetchPool,
        chunk_size: usize,
        tracker: Arc<dyn TrackingSink>,
    ) -> Self {
        Self {
            source,
            pool,
            chunk_size: chunk_size.max(1),
            tracker,
        }
    }

    /// Runs the delivery to completion, cancellation or failure.
    ///
    /// Per-stream line statuses are reported as each stream ends; the
    /// volume status and request end are reported once here. The sink is
    /// dropped before returning.
    pub async fn run<S: ByteSink>(
        self,
        streams: Vec<StreamRequest>,
        mut sink: S,
        mut signals: mpsc::UnboundedReceiver<SinkSignal>,
    ) -> DeliveryOutcome {
        let mut machine = Machine::new();
        let mut cursor = Some(StreamCursor {
            source: Arc::clone(&self.source),
            pending: streams.into(),
            current: None,
            chunk_size: self.chunk_size,
            tracker: Arc::clone(&self.tracker),
        });
        let mut in_flight: Option<JoinHandle<Result<(StreamCursor, Fetched), DeliveryError>>> =
            None;
        let mut ready: Option<Vec<u8>> = None;
        let mut failure: Option<DeliveryError> = None;
        let mut signals_open = true;
        let mut bytes: u64 = 0;

        let mut events = VecDeque::from([Event::Resume]);
        loop {
            while let Some(event) = events.pop_front() {
                match machine.handle(event) {
                    Action::ScheduleFetch => match cursor.take() {
                        Some(mut c) => in_flight = Some(self.pool.spawn(move || {
                            let fetched = c.fetch();
                            (c, fetched)
                        })),
                        None => {
                            failure = Some(DeliveryError::Worker("cursor lost".to_string()));
                            events.push_back(Event::Failed);
                        }
                    },
                    Action::Flush => {
                        let Some(block) = ready.take() else {
                            events.push_back(Event::Flushed);
                            continue;
                        };
                        let len = block.len() as u64;
                        match sink.write(block) {
                            Ok(flow) => {
                                bytes += len;
                                if flow == Flow::Pause {
                                    events.push_back(Event::Pause);
                                }
                                events.push_back(Event::Flushed);
                            }
                            Err(_) => events.push_back(Event::Disconnect),
                        }
                    }
                    Action::Cancel => {
                        if let Some(handle) = in_flight.take() {
                            // The worker runs to completion; its result is dropped.
                            handle.abort();
                        }
                    }
                    Action::Finish | Action::None => {}
                }
            }
            if machine.state().is_terminal() {
                break;
            }

            let woken = tokio::select! {
                biased;
                signal = signals.recv(), if signals_open => Woken::Signal(signal),
                fetched = join(&mut in_flight), if in_flight.is_some() => Woken::Fetch(fetched),
                else => Woken::Stalled,
            };

            match woken {
                Woken::Signal(Some(SinkSignal::Resume)) => events.push_back(Event::Resume),
                Woken::Signal(Some(SinkSignal::Disconnect)) => events.push_back(Event::Disconnect),
                Woken::Signal(None) => signals_open = false,
                Woken::Fetch(result) => {
                    in_flight = None;
                    match result {
                        Ok(Ok((c, fetched))) => {
                            cursor = Some(c);
                            match fetched {
                                Fetched::Block(block) => {
                                    ready = Some(block);
                                    events.push_back(Event::BlockReady);
                                }
                                Fetched::Exhausted => events.push_back(Event::Exhausted),
                                Fetched::Failed(err) => {
                                    failure = Some(err);
                                    events.push_back(Event::Failed);
                                }
                            }
                        }
                        Ok(Err(err)) => {
                            failure = Some(err);
                            events.push_back(Event::Failed);
                        }
                        Err(err) => {
                            failure = Some(DeliveryError::Worker(err.to_string()));
                            events.push_back(Event::Failed);
                        }
                    }
                }
                // Paused with nobody left to resume us.
                Woken::Stalled => events.push_back(Event::Disconnect),
            }
        }
        drop(sink);

        let outcome = match (machine.state(), failure) {
            (PipelineState::Cancelled, _) => DeliveryOutcome::Cancelled { bytes },
            (_, Some(error)) => DeliveryOutcome::Failed { bytes, error },
            _ if bytes == 0 => DeliveryOutcome::NoData,
            _ => DeliveryOutcome::Completed { bytes },
        };
        self.report(&outcome);
        outcome
    }

    fn report(&self, outcome: &DeliveryOutcome) {
        let (status, message) = match outcome {
            DeliveryOutcome::Completed { .. } => (TrackStatus::Ok, String::new()),
            DeliveryOutcome::NoData => (TrackStatus::NoData, NO_WAVEFORMS.to_string()),
            DeliveryOutcome::Cancelled { .. } => (TrackStatus::Cancelled, "cancelled".to_string()),
            DeliveryOutcome::Failed { error, .. } => (TrackStatus::Error, error.to_string()),
        };
        match outcome {
            DeliveryOutcome::Failed { bytes, error } => {
                tracing::error!(bytes, %error, "delivery failed")
            }
            DeliveryOutcome::Cancelled { bytes } => {
                tracing::info!(bytes, "delivery cancelled by client")
            }
            other => tracing::debug!(bytes = other.bytes(), "delivery finished"),
        }
        self.tracker.volume_status(status, outcome.bytes(), &message);
        self.tracker.request_status("END");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mseed::{records, testing::record};
    use crate::sink::SinkClosed;
    use crate::source::MemoryRecordSource;
    use chrono::Duration;
    use seisws_track::LineStatus;
    use seisws_types::{parse_time, StreamId, Time};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn t(s: &str) -> Time {
        parse_time(s).expect("valid time")
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Recorder {
        fn events(&self) -> Vec<String> {
            self.0.lock().expect("lock").clone()
        }
    }

    impl TrackingSink for Recorder {
        fn line_status(&self, line: &LineStatus) {
            self.0
                .lock()
                .expect("lock")
                .push(format!("line:{}:{}:{}", line.stream, line.status, line.bytes));
        }
        fn volume_status(&self, status: TrackStatus, bytes: u64, _message: &str) {
            self.0
                .lock()
                .expect("lock")
                .push(format!("volume:{status}:{bytes}"));
        }
        fn request_status(&self, message: &str) {
            self.0.lock().expect("lock").push(format!("request:{message}"));
        }
    }

    /// Records writes and answers from a script, then `Continue`.
    #[derive(Clone, Default)]
    struct ScriptedSink {
        written: Arc<Mutex<Vec<Vec<u8>>>>,
        script: Arc<Mutex<VecDeque<Result<Flow, SinkClosed>>>>,
    }

    impl ByteSink for ScriptedSink {
        fn write(&mut self, bytes: Vec<u8>) -> Result<Flow, SinkClosed> {
            let answer = self
                .script
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Ok(Flow::Continue));
            if answer.is_ok() {
                self.written.lock().expect("lock").push(bytes);
            }
            answer
        }
    }

    fn request(code: &str, archive_network: &str) -> StreamRequest {
        StreamRequest {
            stream: StreamId::parse(code).expect("valid stream"),
            archive_network: archive_network.to_string(),
            start: t("2021-01-01"),
            end: t("2021-01-02"),
            restricted: false,
        }
    }

    fn minutes(code: &str, count: i64) -> Vec<u8> {
        (0..count)
            .flat_map(|m| record(code, t("2021-01-01") + Duration::minutes(m), 60, 1))
            .collect()
    }

    fn pipeline(source: impl RecordSource + 'static, chunk: usize, tracker: Arc<Recorder>) -> DeliveryPipeline {
        DeliveryPipeline::new(Arc::new(source), FetchPool::new(2), chunk, tracker)
    }

    #[test]
    fn machine_transitions() {
        let mut m = Machine::new();
        assert_eq!(m.handle(Event::Resume), Action::ScheduleFetch);
        assert_eq!(m.state(), PipelineState::Fetching);

        // Resume while a fetch is in flight never schedules a second one.
        assert_eq!(m.handle(Event::Pause), Action::None);
        assert_eq!(m.handle(Event::Resume), Action::None);
        assert_eq!(m.state(), PipelineState::Fetching);

        assert_eq!(m.handle(Event::BlockReady), Action::Flush);
        assert_eq!(m.handle(Event::Pause), Action::None);
        assert_eq!(m.handle(Event::Flushed), Action::None);
        assert_eq!(m.state(), PipelineState::Paused);
        assert_eq!(m.handle(Event::Pause), Action::None);
        assert_eq!(m.handle(Event::Resume), Action::ScheduleFetch);
        assert_eq!(m.handle(Event::Resume), Action::None);

        assert_eq!(m.handle(Event::BlockReady), Action::Flush);
        assert_eq!(m.handle(Event::Flushed), Action::ScheduleFetch);
        assert_eq!(m.handle(Event::Exhausted), Action::Finish);
        assert_eq!(m.state(), PipelineState::Finished);
        assert_eq!(m.handle(Event::Disconnect), Action::None);
        assert_eq!(m.state(), PipelineState::Finished);

        for state_events in [
            vec![],
            vec![Event::Resume],
            vec![Event::Resume, Event::BlockReady],
            vec![Event::Resume, Event::BlockReady, Event::Pause, Event::Flushed],
        ] {
            let mut m = Machine::new();
            for e in state_events {
                m.handle(e);
            }
            assert_eq!(m.handle(Event::Disconnect), Action::Cancel);
            assert_eq!(m.state(), PipelineState::Cancelled);
            assert_eq!(m.handle(Event::Resume), Action::None);
        }
    }

    #[tokio::test]
    async fn delivers_every_byte_with_network_rewritten() {
        let mut source = MemoryRecordSource::new();
        source.push(&minutes("A1.R1..EHZ", 5)).expect("push");
        source.push(&minutes("AM.R2..EHZ", 3)).expect("push");
        let tracker = Arc::new(Recorder::default());
        let sink = ScriptedSink::default();
        let (_signal_tx, signals) = mpsc::unbounded_channel();

        let outcome = pipeline(source, 1024, Arc::clone(&tracker))
            .run(
                vec![
                    request("AM.R1..EHZ", "A1"),
                    request("AM.R2..EHZ", "AM"),
                    request("AM.R9..EHZ", "AM"),
                ],
                sink.clone(),
                signals,
            )
            .await;

        assert!(matches!(outcome, DeliveryOutcome::Completed { bytes: 4096 }));
        let written = sink.written.lock().expect("lock").clone();
        let total: usize = written.iter().map(Vec::len).sum();
        assert_eq!(total, 8 * 512);

        let mut streams = Vec::new();
        for block in &written {
            let codes: Vec<String> = records(block)
                .map(|r| r.expect("record").0.stream.to_string())
                .collect();
            // A block never mixes streams.
            assert!(codes.windows(2).all(|w| w[0] == w[1]));
            streams.extend(codes);
        }
        assert_eq!(streams.iter().filter(|c| *c == "AM.R1..EHZ").count(), 5);
        assert_eq!(streams.iter().filter(|c| *c == "AM.R2..EHZ").count(), 3);

        assert_eq!(
            tracker.events(),
            [
                "line:AM.R1..EHZ:OK:2560",
                "line:AM.R2..EHZ:OK:1536",
                "line:AM.R9..EHZ:NODATA:0",
                "volume:OK:4096",
                "request:END",
            ]
        );
    }

    #[tokio::test]
    async fn unwritable_public_network_fails_the_request() {
        let mut source = MemoryRecordSource::new();
        source.push(&minutes("AM.R2..EHZ", 2)).expect("push");
        source.push(&minutes("A1.R1..EHZ", 3)).expect("push");
        let tracker = Arc::new(Recorder::default());
        let sink = ScriptedSink::default();
        let (_signal_tx, signals) = mpsc::unbounded_channel();

        let outcome = pipeline(source, 4096, Arc::clone(&tracker))
            .run(
                vec![request("AM.R2..EHZ", "AM"), request("ABC.R1..EHZ", "A1")],
                sink.clone(),
                signals,
            )
            .await;

        match outcome {
            DeliveryOutcome::Failed { bytes, error } => {
                assert_eq!(bytes, 1024);
                assert!(matches!(error, DeliveryError::Codec(_)), "{error}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        let total: usize = sink.written.lock().expect("lock").iter().map(Vec::len).sum();
        assert_eq!(total, 1024);
        assert_eq!(
            tracker.events(),
            [
                "line:AM.R2..EHZ:OK:1024",
                "line:ABC.R1..EHZ:ERROR:0",
                "volume:ERROR:1024",
                "request:END",
            ]
        );
    }

    #[tokio::test]
    async fn nothing_found_is_no_data() {
        let tracker = Arc::new(Recorder::default());
        let (_signal_tx, signals) = mpsc::unbounded_channel();
        let outcome = pipeline(MemoryRecordSource::new(), 512, Arc::clone(&tracker))
            .run(vec![request("AM.R1..EHZ", "AM")], ScriptedSink::default(), signals)
            .await;

        assert!(matches!(outcome, DeliveryOutcome::NoData));
        assert_eq!(
            tracker.events(),
            ["line:AM.R1..EHZ:NODATA:0", "volume:NODATA:0", "request:END"]
        );
    }

    /// Counts `next_block` calls on top of an in-memory source.
    struct Counting {
        inner: MemoryRecordSource,
        fetches: Arc<AtomicUsize>,
    }

    struct CountingReader {
        inner: Box<dyn RecordReader>,
        fetches: Arc<AtomicUsize>,
    }

    impl RecordSource for Counting {
        fn open(&self, request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError> {
            Ok(Box::new(CountingReader {
                inner: self.inner.open(request)?,
                fetches: Arc::clone(&self.fetches),
            }))
        }
    }

    impl RecordReader for CountingReader {
        fn next_block(&mut self, max: usize) -> Result<Option<Vec<u8>>, DeliveryError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.next_block(max)
        }
    }

    #[tokio::test]
    async fn no_fetch_while_paused() {
        let mut inner = MemoryRecordSource::new();
        inner.push(&minutes("AM.R1..EHZ", 3)).expect("push");
        let fetches = Arc::new(AtomicUsize::new(0));
        let source = Counting {
            inner,
            fetches: Arc::clone(&fetches),
        };
        let sink = ScriptedSink::default();
        sink.script.lock().expect("lock").push_back(Ok(Flow::Pause));
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let tracker = Arc::new(Recorder::default());

        let run = tokio::spawn(
            pipeline(source, 512, tracker).run(vec![request("AM.R1..EHZ", "AM")], sink.clone(), signals),
        );

        for _ in 0..50 {
            if !sink.written.lock().expect("lock").is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(sink.written.lock().expect("lock").len(), 1);

        signal_tx.send(SinkSignal::Resume).expect("send");
        let outcome = run.await.expect("join");
        assert!(matches!(outcome, DeliveryOutcome::Completed { bytes: 1536 }));
        // Three blocks and the final empty read.
        assert_eq!(fetches.load(Ordering::SeqCst), 4);
    }

    /// First block is immediate; the second waits on a gate.
    struct Gated {
        block: Vec<u8>,
        started: Mutex<Option<tokio::sync::oneshot::Sender<()>>>,
        gate: Mutex<Option<std::sync::mpsc::Receiver<()>>>,
    }

    struct GatedReader {
        first: Option<Vec<u8>>,
        started: Option<tokio::sync::oneshot::Sender<()>>,
        gate: Option<std::sync::mpsc::Receiver<()>>,
    }

    impl RecordSource for Gated {
        fn open(&self, _request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError> {
            Ok(Box::new(GatedReader {
                first: Some(self.block.clone()),
                started: self.started.lock().expect("lock").take(),
                gate: self.gate.lock().expect("lock").take(),
            }))
        }
    }

    impl RecordReader for GatedReader {
        fn next_block(&mut self, _max: usize) -> Result<Option<Vec<u8>>, DeliveryError> {
            if let Some(block) = self.first.take() {
                return Ok(Some(block));
            }
            if let Some(started) = self.started.take() {
                let _ = started.send(());
            }
            if let Some(gate) = self.gate.take() {
                let _ = gate.recv();
            }
            Ok(Some(vec![0u8; 512]))
        }
    }

    #[tokio::test]
    async fn disconnect_while_fetching_cancels() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let source = Gated {
            block: minutes("AM.R1..EHZ", 2),
            started: Mutex::new(Some(started_tx)),
            gate: Mutex::new(Some(gate_rx)),
        };
        let sink = ScriptedSink::default();
        let (signal_tx, signals) = mpsc::unbounded_channel();
        let tracker = Arc::new(Recorder::default());

        let run = tokio::spawn(pipeline(source, 1024, Arc::clone(&tracker)).run(
            vec![request("AM.R1..EHZ", "AM")],
            sink.clone(),
            signals,
        ));

        started_rx.await.expect("second fetch started");
        signal_tx.send(SinkSignal::Disconnect).expect("send");
        let outcome = run.await.expect("join");
        let _ = gate_tx.send(());

        assert!(matches!(outcome, DeliveryOutcome::Cancelled { bytes: 1024 }));
        assert_eq!(sink.written.lock().expect("lock").len(), 1);
        assert_eq!(tracker.events(), ["volume:CANCELLED:1024", "request:END"]);
    }

    #[tokio::test]
    async fn refused_write_cancels() {
        let mut source = MemoryRecordSource::new();
        source.push(&minutes("AM.R1..EHZ", 3)).expect("push");
        let sink = ScriptedSink::default();
        {
            let mut script = sink.script.lock().expect("lock");
            script.push_back(Ok(Flow::Continue));
            script.push_back(Err(SinkClosed));
        }
        let (_signal_tx, signals) = mpsc::unbounded_channel();
        let tracker = Arc::new(Recorder::default());

        let outcome = pipeline(source, 512, Arc::clone(&tracker))
            .run(vec![request("AM.R1..EHZ", "AM")], sink.clone(), signals)
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Cancelled { bytes: 512 }));
        assert_eq!(tracker.events(), ["volume:CANCELLED:512", "request:END"]);
    }

    struct Failing {
        inner: MemoryRecordSource,
    }

    struct FailingReader {
        inner: Box<dyn RecordReader>,
        served: usize,
    }

    impl RecordSource for Failing {
        fn open(&self, request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError> {
            Ok(Box::new(FailingReader {
                inner: self.inner.open(request)?,
                served: 0,
            }))
        }
    }

    impl RecordReader for FailingReader {
        fn next_block(&mut self, max: usize) -> Result<Option<Vec<u8>>, DeliveryError> {
            if self.served == 1 {
                return Err(DeliveryError::Source("disk gone".to_string()));
            }
            self.served += 1;
            self.inner.next_block(max)
        }
    }

    #[tokio::test]
    async fn source_failure_after_flush_is_partial_error() {
        let mut inner = MemoryRecordSource::new();
        inner.push(&minutes("AM.R1..EHZ", 3)).expect("push");
        let tracker = Arc::new(Recorder::default());
        let (_signal_tx, signals) = mpsc::unbounded_channel();

        let outcome = pipeline(Failing { inner }, 512, Arc::clone(&tracker))
            .run(vec![request("AM.R1..EHZ", "AM")], ScriptedSink::default(), signals)
            .await;

        match outcome {
            DeliveryOutcome::Failed { bytes, error } => {
                assert_eq!(bytes, 512);
                assert!(error.to_string().contains("disk gone"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(
            tracker.events(),
            ["line:AM.R1..EHZ:ERROR:512", "volume:ERROR:512", "request:END"]
        );
    }
}
