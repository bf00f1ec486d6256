use std::collections::HashSet;

use ratesync_core::EntityRecord;

/// Orders one pass over every known record, stalest first.
///
/// The order is fixed when the scheduler is built; records updated during the
/// pass are not re-ranked until the next pass reads a fresh snapshot.
#[derive(Debug, Clone, Default)]
pub struct StalenessScheduler {
    queue: Vec<EntityRecord>,
}

impl StalenessScheduler {
    pub fn new(mut records: Vec<EntityRecord>) -> Self {
        // None sorts before Some, so never-synced records come first.
        records.sort_by(|a, b| {
            a.last_sync_time
                .cmp(&b.last_sync_time)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.identifier.clone()));
        Self { queue: records }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.queue.iter().map(|r| r.identifier.as_str())
    }
}

impl IntoIterator for StalenessScheduler {
    type Item = EntityRecord;
    type IntoIter = std::vec::IntoIter<EntityRecord>;

    fn into_iter(self) -> Self::IntoIter {
        self.queue.into_iter()
    }
}
