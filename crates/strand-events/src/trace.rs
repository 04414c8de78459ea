//! Trace reconstruction from flat span rows.
//!
//! Builds a rooted view of one trace from its append-only rows:
//!
//! 1. **Dedup by span ID**: a completed-or-cancelled row supersedes a
//!    partial row; among equally eligible rows the last-written wins.
//! 2. **Cancellation propagation**: a partial span below a cancelled
//!    ancestor reads as cancelled, without mutating stored rows.
//! 3. **Duration override**: such spans take their duration from the
//!    nearest cancelled ancestor's `cancellation` event time.
//!
//! Parent links are never mutated and a span cannot be its own parent, so
//! cycles do not occur in well-formed data; ancestor walks are still bounded
//! by the span count to tolerate malformed input.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use strand_core::SpanId;

use crate::span::{datetime_nanos, SpanRecord, CANCELLATION_EVENT};

/// One span of a reconstructed trace, with derived state applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSpan {
    /// The winning stored row for this span ID.
    pub data: SpanRecord,
    /// Effective open/closed state after cancellation propagation.
    pub is_partial: bool,
    /// Effective cancellation state after propagation.
    pub is_cancelled: bool,
    /// Effective duration in nanoseconds.
    pub duration: u64,
}

impl TraceSpan {
    /// The logical span ID.
    #[must_use]
    pub fn span_id(&self) -> SpanId {
        self.data.span_id
    }

    /// The parent span ID, if any.
    #[must_use]
    pub fn parent_id(&self) -> Option<SpanId> {
        self.data.parent_id
    }
}

/// A reconstructed trace: the root span plus every span of the trace,
/// ordered by start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    /// The span with no parent.
    pub root_span: TraceSpan,
    /// All spans of the trace (including the root), ordered by start time.
    pub spans: Vec<TraceSpan>,
}

impl TraceSummary {
    /// Returns the children of a span, ordered by start time.
    #[must_use]
    pub fn children_of(&self, span_id: SpanId) -> Vec<&TraceSpan> {
        self.spans
            .iter()
            .filter(|span| span.parent_id() == Some(span_id))
            .collect()
    }

    /// Finds a span by its logical ID.
    #[must_use]
    pub fn find(&self, span_id: SpanId) -> Option<&TraceSpan> {
        self.spans.iter().find(|span| span.span_id() == span_id)
    }
}

/// Builds a trace summary from the rows of one trace.
///
/// Rows may arrive in any order and may contain duplicates per span ID.
/// Returns `None` when the trace has no root (no span without a parent).
#[must_use]
pub fn build_trace_summary(rows: Vec<SpanRecord>) -> Option<TraceSummary> {
    let deduped = dedup_spans(rows);
    if deduped.is_empty() {
        return None;
    }

    let by_id: HashMap<SpanId, &SpanRecord> =
        deduped.iter().map(|row| (row.span_id, row)).collect();

    // Memoized "self or any ancestor cancelled", walks bounded by span count.
    let mut cancelled_memo: HashMap<SpanId, bool> = HashMap::new();
    let max_depth = deduped.len();

    let spans: Vec<TraceSpan> = deduped
        .iter()
        .map(|row| derive_span(row, &by_id, &mut cancelled_memo, max_depth))
        .collect();

    let root_span = spans
        .iter()
        .filter(|span| span.parent_id().is_none())
        .min_by_key(|span| span.data.start_time)
        .cloned()?;

    Some(TraceSummary { root_span, spans })
}

/// Deduplicates rows sharing a span ID and returns the winners ordered by
/// start time.
///
/// A row that is completed or cancelled supersedes a partial row; among
/// equally eligible rows the last-written (greatest row ID) wins.
#[must_use]
pub fn dedup_spans(rows: Vec<SpanRecord>) -> Vec<SpanRecord> {
    let mut winners: HashMap<SpanId, SpanRecord> = HashMap::new();
    for row in rows {
        match winners.get(&row.span_id) {
            Some(current) => {
                let replace = match (row.supersedes_partial(), current.supersedes_partial()) {
                    (true, false) => true,
                    (false, true) => false,
                    _ => row.id > current.id,
                };
                if replace {
                    winners.insert(row.span_id, row);
                }
            }
            None => {
                winners.insert(row.span_id, row);
            }
        }
    }

    let mut deduped: Vec<SpanRecord> = winners.into_values().collect();
    deduped.sort_by_key(|row| row.start_time);
    deduped
}

fn derive_span(
    row: &SpanRecord,
    by_id: &HashMap<SpanId, &SpanRecord>,
    cancelled_memo: &mut HashMap<SpanId, bool>,
    max_depth: usize,
) -> TraceSpan {
    let ancestor_cancelled = self_or_ancestor_cancelled(row.span_id, by_id, cancelled_memo, max_depth);

    let is_partial = row.is_partial && !ancestor_cancelled;
    let is_cancelled = row.is_cancelled || (row.is_partial && ancestor_cancelled);

    let duration = if row.is_partial && ancestor_cancelled && !row.is_cancelled {
        nearest_cancellation_nanos(row, by_id, max_depth)
            .map_or(row.duration, |cancelled_at| {
                u64::try_from(cancelled_at.saturating_sub(row.start_time)).unwrap_or(0)
            })
    } else {
        row.duration
    };

    TraceSpan {
        data: row.clone(),
        is_partial,
        is_cancelled,
        duration,
    }
}

fn self_or_ancestor_cancelled(
    span_id: SpanId,
    by_id: &HashMap<SpanId, &SpanRecord>,
    memo: &mut HashMap<SpanId, bool>,
    max_depth: usize,
) -> bool {
    // Iterative walk: collect the chain up to the first known answer, then
    // fill the memo back down.
    let mut chain: Vec<SpanId> = Vec::new();
    let mut current = Some(span_id);
    let mut result = false;

    while let Some(id) = current {
        if chain.len() > max_depth {
            break;
        }
        if let Some(&known) = memo.get(&id) {
            result = known;
            break;
        }
        let Some(row) = by_id.get(&id) else {
            // Missing parent: treat as the top of the tree.
            break;
        };
        chain.push(id);
        if row.is_cancelled {
            result = true;
            break;
        }
        current = row.parent_id;
    }

    for id in chain {
        memo.insert(id, result);
    }
    result
}

/// Walks up from the span's parent to the nearest cancelled ancestor and
/// returns its `cancellation` event time in nanoseconds.
fn nearest_cancellation_nanos(
    row: &SpanRecord,
    by_id: &HashMap<SpanId, &SpanRecord>,
    max_depth: usize,
) -> Option<i64> {
    let mut current = row.parent_id;
    let mut depth = 0;

    while let Some(id) = current {
        if depth > max_depth {
            return None;
        }
        depth += 1;

        let ancestor = by_id.get(&id)?;
        if ancestor.is_cancelled {
            return ancestor
                .find_event(CANCELLATION_EVENT)
                .map(|event| datetime_nanos(event.time));
        }
        current = ancestor.parent_id;
    }
    None
}
