//! Glob-style stream code matching.

use serde::{Deserialize, Serialize};

use crate::StreamId;

/// Matches `text` against a pattern where `*` spans any run of characters
/// and `?` exactly one. ASCII letters compare case-insensitively.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == b'?' || p[pi].eq_ignore_ascii_case(&t[ti])) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == b'*')
}

/// Per-level pattern lists. `None` at a level accepts any code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFilter {
    pub network: Option<Vec<String>>,
    pub station: Option<Vec<String>>,
    pub location: Option<Vec<String>>,
    pub channel: Option<Vec<String>>,
}

fn level_matches(patterns: &Option<Vec<String>>, code: &str) -> bool {
    match patterns {
        None => true,
        Some(list) => list.iter().any(|p| glob_match(p, code)),
    }
}

impl ChannelFilter {
    /// Builds a filter from explicit code patterns, each level a single pattern.
    pub fn single(network: &str, station: &str, location: &str, channel: &str) -> Self {
        let level = |p: &str| {
            if p == "*" {
                None
            } else {
                Some(vec![normalize_location(p)])
            }
        };
        Self {
            network: level(network),
            station: level(station),
            location: level(location),
            channel: level(channel),
        }
    }

    /// True when no level constrains anything.
    pub fn is_any(&self) -> bool {
        self.network.is_none()
            && self.station.is_none()
            && self.location.is_none()
            && self.channel.is_none()
    }

    pub fn match_network(&self, code: &str) -> bool {
        level_matches(&self.network, code)
    }

    pub fn match_station(&self, code: &str) -> bool {
        level_matches(&self.station, code)
    }

    pub fn match_location(&self, code: &str) -> bool {
        level_matches(&self.location, code)
    }

    pub fn match_channel(&self, code: &str) -> bool {
        level_matches(&self.channel, code)
    }

    pub fn matches(&self, id: &StreamId) -> bool {
        self.match_network(&id.network)
            && self.match_station(&id.station)
            && self.match_location(&id.location)
            && self.match_channel(&id.channel)
    }
}

/// `--` is how clients spell the empty location code.
pub(crate) fn normalize_location(code: &str) -> String {
    if code == "--" {
        String::new()
    } else {
        code.to_string()
    }
}
