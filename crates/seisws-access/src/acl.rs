//! Tiered access rules and the authorization predicate.

use std::collections::HashMap;

use seisws_types::Time;
use serde::{Deserialize, Serialize};

use crate::Identity;

const MAIL_PREFIX: &str = "mail:";
const GROUP_PREFIX: &str = "group:";

/// Grants `pattern` access to a network, station, or single stream for a
/// period. Empty codes widen the rule to the enclosing level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
    /// `mail:<address>`, `<address>`, `@<domain>`, or `group:<name>`.
    pub pattern: String,
    pub start: Option<Time>,
    pub end: Option<Time>,
}

impl AccessRule {
    pub fn network(network: &str, pattern: &str) -> Self {
        Self {
            network: network.to_string(),
            station: String::new(),
            location: String::new(),
            channel: String::new(),
            pattern: pattern.to_string(),
            start: None,
            end: None,
        }
    }

    pub fn station(network: &str, station: &str, pattern: &str) -> Self {
        Self {
            station: station.to_string(),
            ..Self::network(network, pattern)
        }
    }

    pub fn stream(network: &str, station: &str, location: &str, channel: &str, pattern: &str) -> Self {
        Self {
            location: location.to_string(),
            channel: channel.to_string(),
            ..Self::station(network, station, pattern)
        }
    }

    pub fn valid(mut self, start: Option<Time>, end: Option<Time>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    /// The rule must cover the whole query window.
    fn covers(&self, t1: &Time, t2: &Time) -> bool {
        self.start.map_or(true, |s| *t1 >= s) && self.end.map_or(true, |e| *t2 <= e)
    }
}

#[derive(Debug, Default)]
struct NetworkRules {
    network: Vec<AccessRule>,
    station: HashMap<String, Vec<AccessRule>>,
    exact: HashMap<String, Vec<AccessRule>>,
}

fn exact_key(station: &str, location: &str, channel: &str) -> String {
    format!("{station}.{location}.{channel}")
}

enum Matcher<'a> {
    Email(&'a str),
    Group(&'a str),
}

impl Matcher<'_> {
    fn matches(&self, pattern: &str) -> bool {
        match self {
            Self::Email(address) => {
                let pattern = pattern.strip_prefix(MAIL_PREFIX).unwrap_or(pattern);
                if address.eq_ignore_ascii_case(pattern) {
                    return true;
                }
                pattern.starts_with('@')
                    && !address.starts_with('@')
                    && address
                        .to_ascii_uppercase()
                        .ends_with(&pattern.to_ascii_uppercase())
            }
            Self::Group(name) => pattern
                .get(..GROUP_PREFIX.len())
                .is_some_and(|p| p.eq_ignore_ascii_case(GROUP_PREFIX))
                && pattern[GROUP_PREFIX.len()..].eq_ignore_ascii_case(name),
        }
    }
}

/// Immutable index of access rules by network, station and stream.
#[derive(Debug, Default)]
pub struct AccessControlList {
    networks: HashMap<String, NetworkRules>,
    len: usize,
}

impl AccessControlList {
    pub fn new(rules: impl IntoIterator<Item = AccessRule>) -> Self {
        let mut acl = Self::default();
        for rule in rules {
            let entry = acl.networks.entry(rule.network.clone()).or_default();
            if rule.station.is_empty() && rule.location.is_empty() && rule.channel.is_empty() {
                entry.network.push(rule);
            } else if rule.location.is_empty() && rule.channel.is_empty() {
                entry
                    .station
                    .entry(rule.station.clone())
                    .or_default()
                    .push(rule);
            } else {
                entry
                    .exact
                    .entry(exact_key(&rule.station, &rule.location, &rule.channel))
                    .or_default()
                    .push(rule);
            }
            acl.len += 1;
        }
        acl
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `identity` may read `net.sta.loc.cha` over `[t1, t2]`.
    ///
    /// Each tier is checked on its own: a station rule grants access even
    /// when no network rule for the same caller does.
    #[allow(clippy::too_many_arguments)]
    pub fn authorize(
        &self,
        identity: &Identity,
        net: &str,
        sta: &str,
        loc: &str,
        cha: &str,
        t1: &Time,
        t2: &Time,
    ) -> bool {
        if identity.blacklisted {
            return false;
        }
        let Some(rules) = self.networks.get(net) else {
            return false;
        };

        let mut matchers = Vec::with_capacity(identity.groups.len() + 1);
        if let Some(email) = identity.email.as_deref() {
            matchers.push(Matcher::Email(email));
        }
        matchers.extend(identity.groups.iter().map(|g| Matcher::Group(g)));

        let station = rules.station.get(sta).map(Vec::as_slice).unwrap_or_default();
        let exact = rules
            .exact
            .get(&exact_key(sta, loc, cha))
            .map(Vec::as_slice)
            .unwrap_or_default();

        matchers.iter().any(|matcher| {
            [rules.network.as_slice(), station, exact]
                .into_iter()
                .flatten()
                .any(|rule| rule.covers(t1, t2) && matcher.matches(&rule.pattern))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use seisws_types::parse_time;

    fn t(s: &str) -> Time {
        parse_time(s).expect("valid time")
    }

    #[test]
    fn domain_rule_grants_whole_network() {
        let acl = AccessControlList::new([
            AccessRule::network("AM", "@example.org").valid(Some(t("2020-01-01")), None)
        ]);
        let user = Identity::with_email("user@example.org");

        assert!(acl.authorize(&user, "AM", "R1234", "", "EHZ", &t("2021-01-01"), &t("2022-01-01")));
        assert!(!acl.authorize(&user, "AM", "R1234", "", "EHZ", &t("2019-06-01"), &t("2021-01-01")));
        assert!(!acl.authorize(&user, "GE", "APE", "", "BHZ", &t("2021-01-01"), &t("2022-01-01")));
    }

    #[test]
    fn email_matching_rules() {
        let acl = AccessControlList::new([
            AccessRule::network("AM", "mail:Alice@Example.org"),
            AccessRule::network("GE", "@gfz.de"),
        ]);
        let (t1, t2) = (t("2021-01-01"), t("2021-01-02"));

        assert!(acl.authorize(&Identity::with_email("alice@example.org"), "AM", "X", "", "Z", &t1, &t2));
        assert!(!acl.authorize(&Identity::with_email("bob@example.org"), "AM", "X", "", "Z", &t1, &t2));
        assert!(acl.authorize(&Identity::with_email("bob@GFZ.de"), "GE", "X", "", "Z", &t1, &t2));
        assert!(!acl.authorize(&Identity::with_email("bob@sub.gfz.de"), "GE", "X", "", "Z", &t1, &t2));
        // A bare domain only ever matches itself, never by suffix.
        assert!(acl.authorize(&Identity::with_email("@gfz.de"), "GE", "X", "", "Z", &t1, &t2));
        assert!(!acl.authorize(&Identity::with_email("@sub.gfz.de"), "GE", "X", "", "Z", &t1, &t2));
    }

    #[test]
    fn group_membership_matches() {
        let acl = AccessControlList::new([AccessRule::station("AM", "R1", "group:EIDA")]);
        let member = Identity::default().with_group("eida");
        let (t1, t2) = (t("2021-01-01"), t("2021-01-02"));

        assert!(acl.authorize(&member, "AM", "R1", "00", "EHZ", &t1, &t2));
        assert!(!acl.authorize(&member, "AM", "R2", "00", "EHZ", &t1, &t2));
        assert!(!acl.authorize(&Identity::default(), "AM", "R1", "00", "EHZ", &t1, &t2));
    }

    #[test]
    fn station_tier_stands_alone() {
        let acl = AccessControlList::new([
            AccessRule::network("AM", "user@example.org")
                .valid(Some(t("2020-01-01")), Some(t("2021-01-01"))),
            AccessRule::station("AM", "R1", "user@example.org")
                .valid(Some(t("2022-01-01")), Some(t("2023-01-01"))),
        ]);
        let user = Identity::with_email("user@example.org");

        assert!(acl.authorize(&user, "AM", "R1", "", "EHZ", &t("2022-03-01"), &t("2022-04-01")));
        assert!(!acl.authorize(&user, "AM", "R2", "", "EHZ", &t("2022-03-01"), &t("2022-04-01")));
        assert!(!acl.authorize(&user, "AM", "R1", "", "EHZ", &t("2020-06-01"), &t("2022-06-01")));
    }

    #[test]
    fn exact_tier_needs_full_code() {
        let acl = AccessControlList::new([AccessRule::stream("AM", "R1", "", "EHZ", "u@x.org")]);
        let user = Identity::with_email("u@x.org");
        let (t1, t2) = (t("2021-01-01"), t("2021-01-02"));

        assert!(acl.authorize(&user, "AM", "R1", "", "EHZ", &t1, &t2));
        assert!(!acl.authorize(&user, "AM", "R1", "", "EHN", &t1, &t2));
        assert_eq!(acl.len(), 1);
    }

    #[test]
    fn blacklist_overrides_every_rule() {
        let acl = AccessControlList::new([
            AccessRule::network("AM", "@example.org"),
            AccessRule::station("AM", "R1", "group:eida"),
            AccessRule::stream("AM", "R1", "", "EHZ", "user@example.org"),
        ]);
        let mut user = Identity::with_email("user@example.org").with_group("eida");
        user.blacklisted = true;

        for (sta, cha) in [("R1", "EHZ"), ("R1", "EHN"), ("R2", "BHZ")] {
            assert!(!acl.authorize(&user, "AM", sta, "", cha, &t("2021-01-01"), &t("2021-01-02")));
        }
    }
}
