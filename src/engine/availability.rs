use crate::model::*;

// ── Day schedule ─────────────────────────────────────────

/// Active windows of a facility that touch `query`, clamped to it and sorted
/// by start. Overlapping windows cannot exist, but adjacent ones stay separate.
pub fn busy_windows(fs: &FacilityState, query: &Span) -> Vec<Span> {
    fs.overlapping(query)
        .map(|i| {
            Span::new(
                i.span.start.max(query.start),
                i.span.end.min(query.end),
            )
        })
        .collect()
}

/// `query` minus every active window, merged.
pub fn free_windows(fs: &FacilityState, query: &Span) -> Vec<Span> {
    let busy = merge_overlapping(&busy_windows(fs, query));
    subtract_intervals(&[*query], &busy)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// Both inputs sorted by start; `to_remove` may overlap itself.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}
