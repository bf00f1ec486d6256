//! Core rating model plus the merge and bulk-deduplication rules shared by
//! both ingestion paths.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ratesync-core";

/// Independently tracked game speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Fast,
    Medium,
    Slow,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Fast, Mode::Medium, Mode::Slow];

    /// Column prefix in the destination table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Medium => "medium",
            Self::Slow => "slow",
        }
    }

    /// Numeric code used by the bulk event log.
    pub fn code(&self) -> i32 {
        match self {
            Self::Fast => 1,
            Self::Medium => 2,
            Self::Slow => 3,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Fast),
            2 => Some(Self::Medium),
            3 => Some(Self::Slow),
            _ => None,
        }
    }
}

/// Rating triple for one mode. `None` means "not known", never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModeRating {
    pub rating: Option<i32>,
    pub deviation: Option<i32>,
    pub last_played: Option<NaiveDate>,
}

impl ModeRating {
    pub fn is_empty(&self) -> bool {
        self.rating.is_none() && self.deviation.is_none() && self.last_played.is_none()
    }

    /// Field-wise coalesce: a present incoming value wins, an absent one keeps `self`.
    pub fn coalesce(self, incoming: ModeRating) -> ModeRating {
        ModeRating {
            rating: incoming.rating.or(self.rating),
            deviation: incoming.deviation.or(self.deviation),
            last_played: incoming.last_played.or(self.last_played),
        }
    }
}

/// Possibly-partial set of triples, as reported by one source for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub fast: ModeRating,
    pub medium: ModeRating,
    pub slow: ModeRating,
}

impl Snapshot {
    pub fn mode(&self, mode: Mode) -> &ModeRating {
        match mode {
            Mode::Fast => &self.fast,
            Mode::Medium => &self.medium,
            Mode::Slow => &self.slow,
        }
    }

    pub fn mode_mut(&mut self, mode: Mode) -> &mut ModeRating {
        match mode {
            Mode::Fast => &mut self.fast,
            Mode::Medium => &mut self.medium,
            Mode::Slow => &mut self.slow,
        }
    }

    pub fn is_empty(&self) -> bool {
        Mode::ALL.iter().all(|m| self.mode(*m).is_empty())
    }

    pub fn coalesce(self, incoming: &Snapshot) -> Snapshot {
        Snapshot {
            fast: self.fast.coalesce(incoming.fast),
            medium: self.medium.coalesce(incoming.medium),
            slow: self.slow.coalesce(incoming.slow),
        }
    }
}

/// Stored state for one identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identifier: String,
    pub ratings: Snapshot,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl EntityRecord {
    /// All-absent record for an identifier the store has never seen.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ratings: Snapshot::default(),
            last_sync_time: None,
        }
    }
}

/// The single reconciliation rule used by the live and bulk paths.
///
/// Every scalar field takes the incoming value when present and keeps the
/// stored one otherwise. `last_sync_time` becomes the later of the stored
/// value and `synced_at`, with `None` ordering before any instant, so it never
/// moves backwards. Re-applying the same `(incoming, synced_at)` to the result
/// returns it unchanged.
pub fn merge_record(
    existing: &EntityRecord,
    incoming: &Snapshot,
    synced_at: Option<DateTime<Utc>>,
) -> EntityRecord {
    EntityRecord {
        identifier: existing.identifier.clone(),
        ratings: existing.ratings.coalesce(incoming),
        // Option<T>: None < Some(_), which is exactly "absent is minus infinity".
        last_sync_time: existing.last_sync_time.max(synced_at),
    }
}

/// One row of the bulk historical log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub identifier: String,
    pub mode_code: i32,
    pub rating: Option<i32>,
    pub sequence: i64,
    /// 1-based position in the input file.
    pub ordinal: u64,
}

impl RawEvent {
    /// True when `self` should replace `current` as the authoritative row:
    /// higher sequence wins, and on equal sequence the later input row wins.
    pub fn supersedes(&self, current: &RawEvent) -> bool {
        (self.sequence, self.ordinal) > (current.sequence, current.ordinal)
    }
}

/// Latest bulk row per `(identifier, mode)`.
#[derive(Debug, Clone, Default)]
pub struct LatestEvents {
    latest: BTreeMap<(String, Mode), RawEvent>,
    pub input_rows: usize,
    pub unknown_mode_rows: usize,
}

impl LatestEvents {
    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }

    pub fn get(&self, identifier: &str, mode: Mode) -> Option<&RawEvent> {
        self.latest.get(&(identifier.to_string(), mode))
    }

    /// Pivot the retained rows into one snapshot per identifier, ordered by identifier.
    pub fn into_snapshots(self) -> Vec<(String, Snapshot)> {
        let mut out: Vec<(String, Snapshot)> = Vec::new();
        for ((identifier, mode), event) in self.latest {
            let needs_new = out.last().map(|(id, _)| id != &identifier).unwrap_or(true);
            if needs_new {
                out.push((identifier, Snapshot::default()));
            }
            if let Some((_, snapshot)) = out.last_mut() {
                snapshot.mode_mut(mode).rating = event.rating;
            }
        }
        out
    }
}

/// Collapse an unordered event log to one authoritative row per `(identifier, mode)`.
///
/// The result depends only on the multiset of rows and their ordinals, not on
/// iteration order. Rows carrying an unknown mode code are counted and dropped.
pub fn dedup_events<I>(events: I) -> LatestEvents
where
    I: IntoIterator<Item = RawEvent>,
{
    let mut out = LatestEvents::default();
    for event in events {
        out.input_rows += 1;
        let Some(mode) = Mode::from_code(event.mode_code) else {
            out.unknown_mode_rows += 1;
            continue;
        };
        match out.latest.get_mut(&(event.identifier.clone(), mode)) {
            Some(current) => {
                if event.supersedes(current) {
                    *current = event;
                }
            }
            None => {
                out.latest.insert((event.identifier.clone(), mode), event);
            }
        }
    }
    out
}
