//! Raw record sources for bulk delivery.

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::{Path, PathBuf};

use chrono::{Datelike, Duration};
use seisws_types::{StreamId, Time};

use crate::error::DeliveryError;
use crate::mseed::{records, CodecError, RecordHeader};
use crate::plan::StreamRequest;

/// Smallest legal miniSEED record; enough to reach blockette 1000.
const RECORD_PROBE_LEN: usize = 128;

/// Opens readers over the archived records of one (stream, window).
pub trait RecordSource: Send + Sync {
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError>;
}

/// Yields whole records in time order.
pub trait RecordReader: Send {
    /// Next run of whole records, at least `max` bytes unless the stream
    /// ends first. `None` once exhausted.
    fn next_block(&mut self, max: usize) -> Result<Option<Vec<u8>>, DeliveryError>;
}

fn overlaps(header: &RecordHeader, start: &Time, end: &Time) -> bool {
    header.start < *end && header.end() > *start
}

/// Records held in memory, keyed by archive stream code.
#[derive(Debug, Default, Clone)]
pub struct MemoryRecordSource {
    streams: HashMap<StreamId, Vec<Vec<u8>>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every record of `block` under the stream its headers name.
    pub fn push(&mut self, block: &[u8]) -> Result<(), CodecError> {
        for item in records(block) {
            let (header, record) = item?;
            self.streams
                .entry(header.stream)
                .or_default()
                .push(record.to_vec());
        }
        Ok(())
    }
}

impl RecordSource for MemoryRecordSource {
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError> {
        let key = request.archive_stream();
        let mut selected = VecDeque::new();
        for record in self.streams.get(&key).into_iter().flatten() {
            let header = RecordHeader::parse(record)?;
            if overlaps(&header, &request.start, &request.end) {
                selected.push_back(record.clone());
            }
        }
        Ok(Box::new(MemoryReader { records: selected }))
    }
}

struct MemoryReader {
    records: VecDeque<Vec<u8>>,
}

impl RecordReader for MemoryReader {
    fn next_block(&mut self, max: usize) -> Result<Option<Vec<u8>>, DeliveryError> {
        let mut block = Vec::new();
        while block.len() < max {
            let Some(record) = self.records.pop_front() else {
                break;
            };
            block.extend_from_slice(&record);
        }
        Ok((!block.is_empty()).then_some(block))
    }
}

/// SeisComP Data Structure archive: one file per stream and day under
/// `<root>/<year>/<net>/<sta>/<cha>.D/`.
#[derive(Debug, Clone)]
pub struct SdsRecordSource {
    root: PathBuf,
}

impl SdsRecordSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the day file holding `stream` records starting on `day`.
    pub fn day_file(&self, stream: &StreamId, day: &Time) -> PathBuf {
        let year = day.year();
        self.root
            .join(year.to_string())
            .join(&stream.network)
            .join(&stream.station)
            .join(format!("{}.D", stream.channel))
            .join(format!(
                "{}.{}.{}.{}.D.{}.{:03}",
                stream.network,
                stream.station,
                stream.location,
                stream.channel,
                year,
                day.ordinal()
            ))
    }
}

impl RecordSource for SdsRecordSource {
    fn open(&self, request: &StreamRequest) -> Result<Box<dyn RecordReader>, DeliveryError> {
        let stream = request.archive_stream();
        // A record starting late on the previous day may reach into the window.
        let mut day = request.start - Duration::days(1);
        let mut files = VecDeque::new();
        while day.date_naive() <= request.end.date_naive() {
            files.push_back(self.day_file(&stream, &day));
            day += Duration::days(1);
        }
        tracing::debug!(stream = %stream, files = files.len(), "opening SDS day files");
        Ok(Box::new(SdsReader {
            files,
            current: None,
            start: request.start,
            end: request.end,
        }))
    }
}

struct SdsReader {
    files: VecDeque<PathBuf>,
    current: Option<BufReader<File>>,
    start: Time,
    end: Time,
}

/// Fills `buf` from `reader`, returning how much was read before EOF.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl SdsReader {
    fn next_record(&mut self) -> Result<Option<Vec<u8>>, DeliveryError> {
        loop {
            let Some(reader) = self.current.as_mut() else {
                let Some(path) = self.files.pop_front() else {
                    return Ok(None);
                };
                match File::open(&path) {
                    Ok(file) => self.current = Some(BufReader::new(file)),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            };

            let mut record = vec![0u8; RECORD_PROBE_LEN];
            let got = read_full(reader, &mut record)?;
            if got == 0 {
                self.current = None;
                continue;
            }
            if got < RECORD_PROBE_LEN {
                return Err(CodecError::Truncated {
                    need: RECORD_PROBE_LEN,
                    have: got,
                }
                .into());
            }

            let header = RecordHeader::parse(&record)?;
            if header.record_len > RECORD_PROBE_LEN {
                record.resize(header.record_len, 0);
                reader.read_exact(&mut record[RECORD_PROBE_LEN..])?;
            }
            if header.start >= self.end {
                // Day files are time ordered; nothing later in this one fits.
                self.current = None;
                continue;
            }
            if overlaps(&header, &self.start, &self.end) {
                return Ok(Some(record));
            }
        }
    }
}

impl RecordReader for SdsReader {
    fn next_block(&mut self, max: usize) -> Result<Option<Vec<u8>>, DeliveryError> {
        let mut block = Vec::new();
        while block.len() < max {
            match self.next_record()? {
                Some(record) => block.extend_from_slice(&record),
                None => break,
            }
        }
        Ok((!block.is_empty()).then_some(block))
    }
}
