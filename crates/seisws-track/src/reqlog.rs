//! JSON request log written through `tracing`.

use std::sync::Mutex;

use chrono::Utc;
use seisws_types::format_time;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{LineStatus, RequestInfo, TrackStatus, TrackingSink};

/// Target the request log is emitted on. Route it to its own file with a
/// subscriber filter such as `seisws::reqlog=info`.
pub const REQLOG_TARGET: &str = "seisws::reqlog";

/// Stable anonymous id: the first 32 bits of `sha256(salt + key)`.
///
/// `key` is the lower-cased user name for authenticated requests and the
/// client address otherwise.
pub fn user_id_hash(salt: &str, key: &str) -> u32 {
    let digest = Sha256::digest(format!("{salt}{key}").as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

#[derive(Debug, Serialize)]
struct TraceEntry {
    net: String,
    sta: String,
    loc: String,
    cha: String,
    start: String,
    end: String,
    restricted: bool,
    status: TrackStatus,
    bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Record {
    service: String,
    #[serde(rename = "userID")]
    user_id: u32,
    #[serde(rename = "clientID")]
    client_id: String,
    user_email: Option<String>,
    auth: bool,
    created: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    trace: Vec<TraceEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<TrackStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished: Option<String>,
}

struct State {
    record: Record,
    logged: bool,
}

/// Accumulates one request's record and logs it once on `request_status`.
pub struct RequestLogTracker {
    user_name: Option<String>,
    state: Mutex<State>,
}

impl RequestLogTracker {
    pub fn new(info: &RequestInfo, user_salt: &str) -> Self {
        let key = match &info.user_name {
            Some(name) => name.to_lowercase(),
            None => info.client_ip.clone(),
        };
        let record = Record {
            service: info.service.clone(),
            user_id: user_id_hash(user_salt, &key),
            client_id: info.user_agent.clone(),
            user_email: None,
            auth: info.user_name.is_some(),
            created: format_time(&Utc::now(), true),
            trace: Vec::new(),
            status: None,
            bytes: None,
            finished: None,
        };
        Self {
            user_name: info.user_name.clone(),
            state: Mutex::new(State {
                record,
                logged: false,
            }),
        }
    }

    fn with_state(&self, f: impl FnOnce(&mut State)) {
        match self.state.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// The JSON line as it would be logged right now.
    pub fn snapshot(&self) -> Option<String> {
        let mut out = None;
        self.with_state(|state| out = serde_json::to_string(&state.record).ok());
        out
    }
}

impl TrackingSink for RequestLogTracker {
    fn line_status(&self, line: &LineStatus) {
        let user_name = self.user_name.clone();
        self.with_state(|state| {
            state.record.trace.push(TraceEntry {
                net: line.stream.network.clone(),
                sta: line.stream.station.clone(),
                loc: line.stream.location.clone(),
                cha: line.stream.channel.clone(),
                start: format_time(&line.start, true),
                end: format_time(&line.end, true),
                restricted: line.restricted,
                status: line.status,
                bytes: line.bytes,
            });
            // Only record who the caller is once they actually received
            // restricted data.
            if line.restricted && line.status == TrackStatus::Ok {
                state.record.user_email = user_name;
            }
        });
    }

    fn volume_status(&self, status: TrackStatus, bytes: u64, _message: &str) {
        self.with_state(|state| {
            state.record.status = Some(status);
            state.record.bytes = Some(bytes);
            state.record.finished = Some(format_time(&Utc::now(), true));
        });
    }

    fn request_status(&self, _message: &str) {
        self.with_state(|state| {
            if state.logged {
                return;
            }
            match serde_json::to_string(&state.record) {
                Ok(line) => tracing::info!(target: REQLOG_TARGET, "{line}"),
                Err(err) => tracing::warn!(error = %err, "failed to serialize request log record"),
            }
            state.logged = true;
        });
    }
}
