//! Metric source contract + the HTTP player-stats adapter.

use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate};
use ratesync_core::{Mode, ModeRating, Snapshot};
use ratesync_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "ratesync-adapters";

/// Result of resolving one identifier at the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Found(Snapshot),
    /// The source has no such entity. Not an error; the caller skips it.
    NotFound,
}

/// Transient failure for one identifier. Callers log it and move on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("request failed: {0}")]
    Request(String),
    #[error("http status {0}")]
    Status(u16),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

#[async_trait]
pub trait MetricSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    /// Resolve one identifier. Must not touch shared state beyond the request.
    async fn fetch(&self, ctx: &FetchContext, identifier: &str) -> Result<FetchOutcome, FetchFailure>;
}

/// Payload key the stats endpoint uses for each mode.
pub fn section_key(mode: Mode) -> &'static str {
    match mode {
        Mode::Fast => "chess_bullet",
        Mode::Medium => "chess_blitz",
        Mode::Slow => "chess_rapid",
    }
}

#[derive(Debug, Deserialize)]
struct ModeSection {
    last: Option<LastGame>,
}

#[derive(Debug, Deserialize)]
struct LastGame {
    rating: Option<i32>,
    rd: Option<i32>,
    date: Option<DateValue>,
}

/// The live API sends epoch seconds; older exports carry a date string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DateValue {
    Epoch(i64),
    Text(String),
}

fn parse_date(value: &DateValue) -> Result<NaiveDate, FetchFailure> {
    match value {
        DateValue::Epoch(secs) => DateTime::from_timestamp(*secs, 0)
            .map(|dt| dt.date_naive())
            .ok_or_else(|| FetchFailure::Malformed(format!("epoch out of range: {secs}"))),
        DateValue::Text(text) => {
            let text = text.trim();
            if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
                return Ok(date);
            }
            DateTime::parse_from_rfc3339(text)
                .map(|dt| dt.naive_utc().date())
                .map_err(|_| FetchFailure::Malformed(format!("unrecognised date {text:?}")))
        }
    }
}

/// Turn a stats document into a snapshot holding only what it reports.
pub fn parse_stats_payload(body: &[u8]) -> Result<Snapshot, FetchFailure> {
    let payload: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(body).map_err(|e| FetchFailure::Malformed(e.to_string()))?;

    let mut snapshot = Snapshot::default();
    for mode in Mode::ALL {
        // Unrelated top-level keys are never deserialized.
        let Some(raw) = payload.get(section_key(mode)) else {
            continue;
        };
        let section = Option::<ModeSection>::deserialize(raw)
            .map_err(|e| FetchFailure::Malformed(format!("{}: {e}", section_key(mode))))?;
        let Some(last) = section.and_then(|s| s.last) else {
            continue;
        };
        *snapshot.mode_mut(mode) = ModeRating {
            rating: last.rating,
            deviation: last.rd,
            last_played: last.date.as_ref().map(parse_date).transpose()?,
        };
    }
    Ok(snapshot)
}

/// Public player-stats endpoint: `GET {base}/pub/player/{identifier}/stats`.
#[derive(Debug)]
pub struct PlayerStatsSource {
    http: HttpFetcher,
    base_url: Url,
}

impl PlayerStatsSource {
    pub fn new(http: HttpFetcher, base_url: &str) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url).with_context(|| format!("parsing api base url {base_url}"))?;
        if base_url.cannot_be_a_base() {
            bail!("api base url {base_url} cannot carry a path");
        }
        Ok(Self { http, base_url })
    }

    pub fn stats_url(&self, identifier: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["pub", "player", identifier, "stats"]);
        }
        url
    }
}

#[async_trait]
impl MetricSource for PlayerStatsSource {
    fn source_id(&self) -> &'static str {
        "player-stats"
    }

    async fn fetch(&self, ctx: &FetchContext, identifier: &str) -> Result<FetchOutcome, FetchFailure> {
        let url = self.stats_url(identifier);
        match self.http.fetch_bytes(ctx.run_id, url.as_str()).await {
            Ok(body) => {
                let snapshot = parse_stats_payload(&body)?;
                debug!(identifier, medium_rating = ?snapshot.medium.rating, "stats fetched");
                Ok(FetchOutcome::Found(snapshot))
            }
            Err(err) if err.is_not_found() => Ok(FetchOutcome::NotFound),
            Err(FetchError::HttpStatus { status, .. }) => Err(FetchFailure::Status(status)),
            Err(err) => Err(FetchFailure::Request(err.to_string())),
        }
    }
}
