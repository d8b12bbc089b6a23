//! miniSEED 2 fixed header reading and network code rewriting.
//!
//! Only the 48-byte fixed header and blockette 1000 are interpreted;
//! sample payloads pass through untouched.

use chrono::{Duration, NaiveDate};
use seisws_types::{StreamId, Time};
use thiserror::Error;

pub const FIXED_HEADER_LEN: usize = 48;

/// Record length assumed when no blockette 1000 is present.
pub const DEFAULT_RECORD_LEN: usize = 512;

const MIN_RECORD_EXP: u8 = 7;
const MAX_RECORD_EXP: u8 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("record truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("invalid fixed header: {0}")]
    InvalidHeader(&'static str),

    #[error("network code {0:?} does not fit two bytes")]
    NetworkTooLong(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Big,
    Little,
}

impl ByteOrder {
    fn u16(self, b: &[u8]) -> u16 {
        let raw = [b[0], b[1]];
        match self {
            Self::Big => u16::from_be_bytes(raw),
            Self::Little => u16::from_le_bytes(raw),
        }
    }

    fn i16(self, b: &[u8]) -> i16 {
        let raw = [b[0], b[1]];
        match self {
            Self::Big => i16::from_be_bytes(raw),
            Self::Little => i16::from_le_bytes(raw),
        }
    }

    /// Word order is inferred from a plausible start year.
    fn detect(header: &[u8]) -> Option<Self> {
        let plausible = |y: u16| (1900..=2100).contains(&y);
        if plausible(Self::Big.u16(&header[20..22])) {
            Some(Self::Big)
        } else if plausible(Self::Little.u16(&header[20..22])) {
            Some(Self::Little)
        } else {
            None
        }
    }
}

fn code(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}

/// Decoded fixed header of one record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordHeader {
    pub stream: StreamId,
    pub quality: char,
    pub start: Time,
    pub sample_count: u16,
    pub sample_rate: f64,
    pub record_len: usize,
}

impl RecordHeader {
    pub fn parse(record: &[u8]) -> Result<Self, CodecError> {
        if record.len() < FIXED_HEADER_LEN {
            return Err(CodecError::Truncated {
                need: FIXED_HEADER_LEN,
                have: record.len(),
            });
        }
        let order = ByteOrder::detect(record).ok_or(CodecError::InvalidHeader("start year"))?;

        let stream = StreamId::new(
            code(&record[18..20]),
            code(&record[8..13]),
            code(&record[13..15]),
            code(&record[15..18]),
        );
        let quality = record[6] as char;

        let year = order.u16(&record[20..22]);
        let doy = order.u16(&record[22..24]);
        let (hour, minute, second) = (record[24], record[25], record[26]);
        let fract = order.u16(&record[28..30]);
        let start = NaiveDate::from_yo_opt(i32::from(year), u32::from(doy))
            .and_then(|d| d.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second.min(59))))
            .ok_or(CodecError::InvalidHeader("start time"))?
            .and_utc()
            // Leap seconds are folded into the next minute.
            + Duration::seconds(i64::from(second.saturating_sub(59)))
            + Duration::microseconds(i64::from(fract) * 100);

        let sample_count = order.u16(&record[30..32]);
        let sample_rate = rate(order.i16(&record[32..34]), order.i16(&record[34..36]));

        let record_len = blockette_1000_len(record, order)?.unwrap_or(DEFAULT_RECORD_LEN);

        Ok(Self {
            stream,
            quality,
            start,
            sample_count,
            sample_rate,
            record_len,
        })
    }

    /// Time just after the last sample.
    pub fn end(&self) -> Time {
        if self.sample_rate <= 0.0 {
            return self.start;
        }
        let micros = (f64::from(self.sample_count) / self.sample_rate * 1_000_000.0).round();
        self.start + Duration::microseconds(micros as i64)
    }
}

fn rate(factor: i16, multiplier: i16) -> f64 {
    let (f, m) = (f64::from(factor), f64::from(multiplier));
    match (factor, multiplier) {
        (0, _) | (_, 0) => 0.0,
        (f_, m_) if f_ > 0 && m_ > 0 => f * m,
        (f_, _) if f_ > 0 => -f / m,
        (_, m_) if m_ > 0 => -m / f,
        _ => 1.0 / (f * m),
    }
}

/// Record length from blockette 1000, if the record carries one.
fn blockette_1000_len(record: &[u8], order: ByteOrder) -> Result<Option<usize>, CodecError> {
    let mut offset = usize::from(order.u16(&record[46..48]));
    let mut hops = 0;
    while offset != 0 && hops < 16 {
        if offset + 8 > record.len() {
            return Err(CodecError::Truncated {
                need: offset + 8,
                have: record.len(),
            });
        }
        let kind = order.u16(&record[offset..offset + 2]);
        if kind == 1000 {
            let exp = record[offset + 6];
            if !(MIN_RECORD_EXP..=MAX_RECORD_EXP).contains(&exp) {
                return Err(CodecError::InvalidHeader("record length exponent"));
            }
            return Ok(Some(1usize << exp));
        }
        let next = usize::from(order.u16(&record[offset + 2..offset + 4]));
        if next != 0 && next <= offset {
            return Err(CodecError::InvalidHeader("blockette chain"));
        }
        offset = next;
        hops += 1;
    }
    Ok(None)
}

/// Walks the records of a block of concatenated miniSEED records.
pub fn records(block: &[u8]) -> Records<'_> {
    Records { block, offset: 0 }
}

pub struct Records<'a> {
    block: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(RecordHeader, &'a [u8]), CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.block.len() {
            return None;
        }
        let rest = &self.block[self.offset..];
        let header = match RecordHeader::parse(rest) {
            Ok(header) => header,
            Err(err) => {
                self.offset = self.block.len();
                return Some(Err(err));
            }
        };
        if header.record_len > rest.len() {
            self.offset = self.block.len();
            return Some(Err(CodecError::Truncated {
                need: header.record_len,
                have: rest.len(),
            }));
        }
        self.offset += header.record_len;
        Some(Ok((header.clone(), &rest[..header.record_len])))
    }
}

/// Overwrites the network code of every record in `block` in place.
///
/// Returns the number of records rewritten. On error the block may be
/// partially rewritten and must be discarded.
pub fn rewrite_network(block: &mut [u8], network: &str) -> Result<usize, CodecError> {
    if network.len() > 2 || !network.is_ascii() {
        return Err(CodecError::NetworkTooLong(network.to_string()));
    }
    let mut padded = [b' '; 2];
    padded[..network.len()].copy_from_slice(network.as_bytes());

    let mut offset = 0;
    let mut count = 0;
    while offset < block.len() {
        let header = RecordHeader::parse(&block[offset..])?;
        if offset + header.record_len > block.len() {
            return Err(CodecError::Truncated {
                need: header.record_len,
                have: block.len() - offset,
            });
        }
        block[offset + 18..offset + 20].copy_from_slice(&padded);
        offset += header.record_len;
        count += 1;
    }
    Ok(count)
}
