//! In-memory deduplication of event batches collected from overlapping
//! sources, run before first persistence.

use serde::Serialize;
use townbeat_core::{similarity, Event, EventSource};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "townbeat-dedup";

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Pairwise similarity at or above this joins an anchor's group.
    pub threshold: f64,
    /// Source whose record wins field conflicts within a merged group.
    pub preferred_source: EventSource,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            preferred_source: EventSource::Facebook,
        }
    }
}

/// A candidate duplicate pair, reported for manual review.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicatePair {
    pub left: usize,
    pub right: usize,
    pub score: f64,
}

/// Deduplicate a batch of events with greedy anchor-driven clustering.
///
/// Events from the preferred source are moved to the front (stable order
/// otherwise), then each unprocessed event anchors a group that absorbs
/// every later unprocessed event scoring at or above the threshold against
/// that anchor. Groups are merged into their first member; output is sorted
/// by date, then start time with missing start times last. Pure function,
/// no storage access.
pub fn deduplicate(events: Vec<Event>, config: &DedupConfig) -> Vec<Event> {
    if events.is_empty() {
        return Vec::new();
    }

    let input_count = events.len();
    info!(
        event_count = input_count,
        threshold = config.threshold,
        "deduplication start"
    );

    let mut sorted = events;
    sorted.sort_by_key(|e| e.source != config.preferred_source);

    let mut consumed = vec![false; sorted.len()];
    let mut result: Vec<Event> = Vec::with_capacity(sorted.len());

    for i in 0..sorted.len() {
        if consumed[i] {
            continue;
        }
        consumed[i] = true;

        let mut merged = sorted[i].clone();
        for j in (i + 1)..sorted.len() {
            if consumed[j] {
                continue;
            }
            // Scored against the group anchor, not transitively.
            let score = similarity(&sorted[i], &sorted[j]);
            if score >= config.threshold {
                debug!(
                    anchor = %sorted[i].title,
                    duplicate = %sorted[j].title,
                    score = format!("{score:.2}"),
                    "duplicate found"
                );
                consumed[j] = true;
                merged = merge_events(merged, &sorted[j]);
            }
        }
        result.push(merged);
    }

    result.sort_by(|a, b| {
        a.date.cmp(&b.date).then_with(|| match (a.start_time, b.start_time) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
    });

    info!(
        original_count = input_count,
        deduplicated_count = result.len(),
        duplicates_removed = input_count - result.len(),
        "deduplication complete"
    );

    result
}

/// Merge a duplicate into the primary record. Only fields the primary lacks
/// are taken from the secondary; non-null primary values are never replaced.
fn merge_events(mut primary: Event, secondary: &Event) -> Event {
    if primary.description.is_none() {
        primary.description = secondary.description.clone();
    }
    if primary.ticket_url.is_none() {
        primary.ticket_url = secondary.ticket_url.clone();
    }
    if primary.image_url.is_none() {
        primary.image_url = secondary.image_url.clone();
    }
    if primary.start_time.is_none() {
        primary.start_time = secondary.start_time;
    }
    if primary.end_time.is_none() {
        primary.end_time = secondary.end_time;
    }
    primary
}

/// Report every pair scoring at or above the threshold, by input index.
/// Useful for debugging thresholds and manual review; does not merge.
pub fn find_duplicates(events: &[Event], threshold: f64) -> Vec<DuplicatePair> {
    let mut pairs = Vec::new();
    for i in 0..events.len() {
        for j in (i + 1)..events.len() {
            let score = similarity(&events[i], &events[j]);
            if score >= threshold {
                pairs.push(DuplicatePair {
                    left: i,
                    right: j,
                    score,
                });
            }
        }
    }
    pairs
}
