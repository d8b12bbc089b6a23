#![allow(dead_code)]

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::http::{header, Request};
use base64::Engine;
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use rusqlite::params;
use seisws_access::hash_password;
use seisws_db::{create_pool, run_migrations, time_to_micros, DbPool, DbRuntimeSettings};
use seisws_server::config::Config;
use seisws_server::AppState;
use tempfile::TempDir;

pub const OPEN_STREAM: &str = "XX.ABC..HHZ";
pub const RESTRICTED_STREAM: &str = "XY.RES.00.BHZ";

pub fn t(s: &str) -> DateTime<Utc> {
    seisws_types::parse_time(s).expect("valid time")
}

/// A seeded database, SDS archive and users file in a temporary directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub pool: DbPool,
    pub config: Config,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db_path = dir.path().join("seisws.db");
        let pool = create_pool(
            db_path.to_str().expect("utf-8 path"),
            DbRuntimeSettings::default(),
        )
        .expect("pool");
        {
            let conn = pool.get().expect("connection");
            run_migrations(&conn).expect("migrations");
        }

        let users_file = dir.path().join("users.toml");
        std::fs::write(
            &users_file,
            format!(
                r#"
blacklist = ["mallory"]

[[users]]
name = "alice"
email = "alice@example.org"
salt = "a1"
password_sha256 = "{alice}"

[[users]]
name = "bob"
email = "bob@elsewhere.net"
salt = "b2"
password_sha256 = "{bob}"

[[users]]
name = "mallory"
email = "mallory@example.org"
salt = "m3"
password_sha256 = "{mallory}"
"#,
                alice = hash_password("a1", "wonderland"),
                bob = hash_password("b2", "builder"),
                mallory = hash_password("m3", "sneaky"),
            ),
        )
        .expect("write users file");

        let mut config = Config::default();
        config.database.path = db_path.display().to_string();
        config.availability.open_streams = Some(vec![OPEN_STREAM.to_string()]);
        config.dataselect.archive_path = dir.path().join("sds").display().to_string();
        config.access.users_file = Some(users_file.display().to_string());
        config.tracking.request_log = false;

        Self { dir, pool, config }
    }

    pub fn sds_root(&self) -> PathBuf {
        PathBuf::from(&self.config.dataselect.archive_path)
    }

    pub fn state(&self) -> AppState {
        AppState::build(&self.config, self.pool.clone(), None).expect("app state")
    }

    pub fn app(&self) -> axum::Router {
        seisws_server::app(self.state())
    }

    /// Inserts an extent with one attribute extent and the given segments.
    pub fn seed_extent(&self, code: &str, rate: f64, segments: &[(&str, &str)]) -> i64 {
        let id = seisws_types::StreamId::parse(code).expect("stream code");
        let start = segments.iter().map(|(s, _)| t(s)).min().expect("segments");
        let end = segments.iter().map(|(_, e)| t(e)).max().expect("segments");
        let updated = t("2024-02-01T00:00:00");
        let conn = self.pool.get().expect("connection");
        conn.execute(
            "INSERT INTO data_extents
                (network, station, location, channel, start_us, end_us, updated_us, segment_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.network,
                id.station,
                id.location,
                id.channel,
                time_to_micros(&start),
                time_to_micros(&end),
                time_to_micros(&updated),
                segments.len() as i64
            ],
        )
        .expect("insert extent");
        let extent_id = conn.last_insert_rowid();
        conn.execute(
            "INSERT INTO data_attribute_extents
                (extent_id, quality, sample_rate, start_us, end_us, updated_us, segment_count)
             VALUES (?1, 'D', ?2, ?3, ?4, ?5, ?6)",
            params![
                extent_id,
                rate,
                time_to_micros(&start),
                time_to_micros(&end),
                time_to_micros(&updated),
                segments.len() as i64
            ],
        )
        .expect("insert attribute extent");
        for (s, e) in segments {
            conn.execute(
                "INSERT INTO data_segments
                    (extent_id, start_us, end_us, updated_us, quality, sample_rate)
                 VALUES (?1, ?2, ?3, ?4, 'D', ?5)",
                params![
                    extent_id,
                    time_to_micros(&t(s)),
                    time_to_micros(&t(e)),
                    time_to_micros(&updated),
                    rate
                ],
            )
            .expect("insert segment");
        }
        extent_id
    }

    pub fn grant(&self, network: &str, pattern: &str) {
        let conn = self.pool.get().expect("connection");
        conn.execute(
            "INSERT INTO access_rules (network, pattern) VALUES (?1, ?2)",
            params![network, pattern],
        )
        .expect("insert rule");
    }

    /// Writes `count` one-second records at 100 Hz starting at `start`.
    pub fn write_day_file(&self, code: &str, start: &str, count: usize) -> usize {
        let id = seisws_types::StreamId::parse(code).expect("stream code");
        let start = t(start);
        let path = day_file(&self.sds_root(), &id, &start);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("sds dirs");
        let mut bytes = Vec::new();
        for i in 0..count {
            bytes.extend(record(code, start + Duration::seconds(i as i64), 100, 100));
        }
        std::fs::write(&path, &bytes).expect("write day file");
        bytes.len()
    }
}

fn day_file(root: &Path, id: &seisws_types::StreamId, day: &DateTime<Utc>) -> PathBuf {
    root.join(day.year().to_string())
        .join(&id.network)
        .join(&id.station)
        .join(format!("{}.D", id.channel))
        .join(format!(
            "{}.{}.{}.{}.D.{}.{:03}",
            id.network,
            id.station,
            id.location,
            id.channel,
            day.year(),
            day.ordinal()
        ))
}

/// A big-endian 512-byte Mini-SEED record with blockette 1000.
pub fn record(code: &str, start: DateTime<Utc>, samples: u16, rate_hz: i16) -> Vec<u8> {
    let id = seisws_types::StreamId::parse(code).expect("stream code");
    let mut rec = vec![0u8; 512];
    rec[0..6].copy_from_slice(b"000001");
    rec[6] = b'D';
    rec[7] = b' ';
    let mut put = |range: std::ops::Range<usize>, value: &str| {
        let field = &mut rec[range];
        field.fill(b' ');
        field[..value.len()].copy_from_slice(value.as_bytes());
    };
    put(8..13, &id.station);
    put(13..15, &id.location);
    put(15..18, &id.channel);
    put(18..20, &id.network);
    rec[20..22].copy_from_slice(&(start.year() as u16).to_be_bytes());
    rec[22..24].copy_from_slice(&(start.ordinal() as u16).to_be_bytes());
    rec[24] = start.hour() as u8;
    rec[25] = start.minute() as u8;
    rec[26] = start.second() as u8;
    rec[30..32].copy_from_slice(&samples.to_be_bytes());
    rec[32..34].copy_from_slice(&rate_hz.to_be_bytes());
    rec[34..36].copy_from_slice(&1i16.to_be_bytes());
    rec[39] = 1;
    rec[44..46].copy_from_slice(&64u16.to_be_bytes());
    rec[46..48].copy_from_slice(&48u16.to_be_bytes());
    rec[48..50].copy_from_slice(&1000u16.to_be_bytes());
    rec[52] = 10;
    rec[53] = 1;
    rec[54] = 9;
    rec
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).expect("request")
}

pub fn get_as(uri: &str, user: &str, password: &str) -> Request<Body> {
    let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Basic {token}"))
        .body(Body::empty())
        .expect("request")
}

pub fn post(uri: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::from(body.to_string()))
        .expect("request")
}

pub async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body")
        .to_vec()
}

pub async fn body_text(response: axum::response::Response) -> String {
    String::from_utf8(body_bytes(response).await).expect("utf-8 body")
}
