use crate::beat::{Beats, Time, VISUAL_SLACK};
use crate::span::Span;
use log::warn;
use std::collections::BTreeMap;

/// A time-sliced fragment of a span, assigned to one of `subindices`
/// side-by-side sub-lanes so that overlapping spans in the same lane can be
/// drawn as adjacent narrower columns. Produced fresh per rendering pass;
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubSpan {
    pub id: usize,
    pub pos: i32,
    /// True start/end of the parent span, for cap-drawing decisions.
    pub span_start: Time,
    pub span_end: Time,
    pub start: Time,
    pub end: Time,
    pub subindex: usize,
    pub subindices: usize,
    /// Whether this fragment touches the parent span's true start/end.
    pub first: bool,
    pub last: bool,
}

/// Partition the given spans into sub-lane fragments.
///
/// Each lane is swept independently over its start/end events in time order.
/// Events closer together than the slack are coalesced into a single
/// re-packing step, so rapid-fire near-coincident changes do not flicker.
/// At each step the active set is re-sorted by id and re-assigned sub-lanes;
/// an active span whose assignment shifts is split at the re-pack instant.
pub fn subindex(spans: &[Span]) -> Vec<SubSpan> {
    subindex_with_slack(spans, VISUAL_SLACK)
}

pub fn subindex_with_slack(spans: &[Span], slack: Beats) -> Vec<SubSpan> {
    let mut lanes: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (idx, span) in spans.iter().enumerate() {
        lanes.entry(span.pos).or_default().push(idx);
    }

    let mut out = Vec::new();
    for indices in lanes.values() {
        pack_lane(spans, indices, slack, &mut out);
    }

    out.retain(|sub| match validate(sub, slack) {
        Ok(()) => true,
        Err(e) => {
            warn!("Dropping invalid subspan: {}", e);
            false
        }
    });
    out
}

struct Event {
    time: f32,
    is_start: bool,
    idx: usize,
}

/// One still-open fragment during the sweep.
struct OpenSub {
    idx: usize,
    start: Time,
    subindex: usize,
    subindices: usize,
    first: bool,
}

fn pack_lane(spans: &[Span], indices: &[usize], slack: Beats, out: &mut Vec<SubSpan>) {
    let mut events = Vec::with_capacity(indices.len() * 2);
    for &idx in indices {
        events.push(Event {
            time: spans[idx].start.beat(),
            is_start: true,
            idx,
        });
        events.push(Event {
            time: spans[idx].end.beat(),
            is_start: false,
            idx,
        });
    }
    events.sort_by(|a, b| a.time.partial_cmp(&b.time).unwrap_or(std::cmp::Ordering::Equal));

    let mut active: Vec<usize> = Vec::new();
    let mut open: Vec<OpenSub> = Vec::new();

    let mut i = 0;
    while i < events.len() {
        let group_time = Time::on_beat(events[i].time);

        // Coalesce events that land within the slack of each other.
        let mut j = i;
        let mut last_time = events[i].time;
        while j < events.len() {
            let t = events[j].time;
            let coalesces =
                t - last_time < slack.beats() || (t.is_infinite() && last_time.is_infinite());
            if !coalesces {
                break;
            }
            last_time = t;
            j += 1;
        }

        let mut started: Vec<usize> = Vec::new();
        let mut ended: Vec<usize> = Vec::new();
        for ev in &events[i..j] {
            if ev.is_start {
                started.push(ev.idx);
            } else {
                ended.push(ev.idx);
            }
        }

        // A span starting and ending within one coalescing window is too
        // short to take part in packing; it gets a single full-width flash.
        let flash: Vec<usize> = started
            .iter()
            .copied()
            .filter(|idx| ended.contains(idx))
            .collect();
        for &idx in &flash {
            let span = &spans[idx];
            out.push(SubSpan {
                id: span.id,
                pos: span.pos,
                span_start: span.start,
                span_end: span.end,
                start: span.start,
                end: span.end,
                subindex: 0,
                subindices: 1,
                first: true,
                last: true,
            });
        }
        started.retain(|idx| !flash.contains(idx));
        ended.retain(|idx| !flash.contains(idx));

        for &idx in &ended {
            active.retain(|&a| a != idx);
        }
        active.extend(&started);

        // New packing: active spans sorted by id (then insertion order).
        let mut ordered = active.clone();
        ordered.sort_by_key(|&idx| (spans[idx].id, idx));
        let subindices = ordered.len();
        let assignment = |idx: usize| -> Option<usize> {
            ordered.iter().position(|&o| o == idx)
        };

        // Close pass: walk open fragments in order, emitting those whose span
        // ended or whose assignment shifted.
        let mut kept: Vec<OpenSub> = Vec::new();
        let mut reopen: Vec<usize> = Vec::new();
        for sub in open.drain(..) {
            let span = &spans[sub.idx];
            if ended.contains(&sub.idx) {
                out.push(SubSpan {
                    id: span.id,
                    pos: span.pos,
                    span_start: span.start,
                    span_end: span.end,
                    start: sub.start,
                    end: group_time,
                    subindex: sub.subindex,
                    subindices: sub.subindices,
                    first: sub.first,
                    last: true,
                });
            } else if assignment(sub.idx) != Some(sub.subindex) || subindices != sub.subindices {
                out.push(SubSpan {
                    id: span.id,
                    pos: span.pos,
                    span_start: span.start,
                    span_end: span.end,
                    start: sub.start,
                    end: group_time,
                    subindex: sub.subindex,
                    subindices: sub.subindices,
                    first: sub.first,
                    last: false,
                });
                reopen.push(sub.idx);
            } else {
                kept.push(sub);
            }
        }
        for &idx in &started {
            if let Some(subindex) = assignment(idx) {
                kept.push(OpenSub {
                    idx,
                    start: group_time,
                    subindex,
                    subindices,
                    first: true,
                });
            }
        }
        for &idx in &reopen {
            if let Some(subindex) = assignment(idx) {
                kept.push(OpenSub {
                    idx,
                    start: group_time,
                    subindex,
                    subindices,
                    first: false,
                });
            }
        }
        open = kept;

        i = j;
    }

    for sub in open {
        // Every span contributes an end event (possibly at +inf), so the
        // sweep should always drain. Anything left is a bug worth hearing
        // about, but not worth dying for.
        warn!("Lane sweep left an open fragment for span {}", spans[sub.idx]);
    }
}

fn validate(sub: &SubSpan, slack: Beats) -> Result<(), String> {
    if sub.subindices == 0 {
        return Err(format!("subindices=0 for span {}@{}", sub.id, sub.pos));
    }
    if sub.subindex >= sub.subindices {
        return Err(format!(
            "subindex {} >= subindices {} for span {}@{}",
            sub.subindex, sub.subindices, sub.id, sub.pos
        ));
    }
    if sub.end.before(sub.start) {
        return Err(format!(
            "inverted fragment [{}:{}] for span {}@{}",
            sub.start, sub.end, sub.id, sub.pos
        ));
    }
    if sub.start.before(sub.span_start - slack) || sub.end.after(sub.span_end + slack) {
        return Err(format!(
            "fragment [{}:{}] outside parent [{}:{}] for span {}@{}",
            sub.start, sub.end, sub.span_start, sub.span_end, sub.id, sub.pos
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(id: usize, pos: i32, start: f32, end: f32) -> Span {
        Span {
            id,
            pos,
            start: Time::on_beat(start),
            end: Time::on_beat(end),
        }
    }

    fn almost_equal(a: f32, b: f32) -> bool {
        (b - a).abs() < 1e-3
    }

    /// Expected fragment: (id, start, end, subindex, subindices, first, last).
    type Want = (usize, f32, f32, usize, usize, bool, bool);

    fn check(name: &str, spans: &[Span], want: &[Want]) {
        let got = subindex(spans);
        assert_eq!(
            got.len(),
            want.len(),
            "{}: expected {} subspans, got {:?}",
            name,
            want.len(),
            got
        );
        for (i, (sub, w)) in got.iter().zip(want).enumerate() {
            assert_eq!(sub.id, w.0, "{}: subspan[{}] id", name, i);
            assert!(
                almost_equal(sub.start.beat(), w.1) && almost_equal(sub.end.beat(), w.2),
                "{}: subspan[{}] want {:.3}->{:.3}, got {:.3}->{:.3}",
                name,
                i,
                w.1,
                w.2,
                sub.start.beat(),
                sub.end.beat()
            );
            assert_eq!(
                (sub.subindex, sub.subindices),
                (w.3, w.4),
                "{}: subspan[{}] indices",
                name,
                i
            );
            assert_eq!(sub.first, w.5, "{}: subspan[{}] first", name, i);
            assert_eq!(sub.last, w.6, "{}: subspan[{}] last", name, i);
        }
    }

    #[test]
    fn test_single_span() {
        check(
            "single span",
            &[span(0, 0, 0.0, 1.0)],
            &[(0, 0.0, 1.0, 0, 1, true, true)],
        );
    }

    #[test]
    fn test_no_overlap_in_time() {
        check(
            "no overlap in time",
            &[span(0, 0, 0.0, 0.5), span(1, 0, 0.5, 1.0)],
            &[
                (0, 0.0, 0.5, 0, 1, true, true),
                (1, 0.5, 1.0, 0, 1, true, true),
            ],
        );
    }

    #[test]
    fn test_no_overlap_in_pos() {
        check(
            "no overlap in pos",
            &[span(0, 0, 0.0, 1.0), span(1, 1, 0.0, 1.0)],
            &[
                (0, 0.0, 1.0, 0, 1, true, true),
                (1, 0.0, 1.0, 0, 1, true, true),
            ],
        );
    }

    #[test]
    fn test_full_overlap() {
        check(
            "full overlap",
            &[span(0, 0, 0.0, 1.0), span(1, 0, 0.0, 1.0)],
            &[
                (0, 0.0, 1.0, 0, 2, true, true),
                (1, 0.0, 1.0, 1, 2, true, true),
            ],
        );
    }

    #[test]
    fn test_partial_overlap() {
        check(
            "partial overlap",
            &[span(0, 0, 0.0, 0.8), span(1, 0, 0.2, 1.0)],
            &[
                (0, 0.0, 0.2, 0, 1, true, false),
                (1, 0.2, 0.8, 1, 2, true, false),
                (0, 0.2, 0.8, 0, 2, false, true),
                (1, 0.8, 1.0, 0, 1, false, true),
            ],
        );
    }

    #[test]
    fn test_wholly_contained() {
        check(
            "wholly contained",
            &[span(0, 0, 0.0, 1.0), span(1, 0, 0.2, 0.8)],
            &[
                (0, 0.0, 0.2, 0, 1, true, false),
                (1, 0.2, 0.8, 1, 2, true, true),
                (0, 0.2, 0.8, 0, 2, false, false),
                (0, 0.8, 1.0, 0, 1, false, true),
            ],
        );
    }

    #[test]
    fn test_partial_overlap_tiles_without_gaps() {
        let subs = subindex(&[span(0, 0, 0.0, 0.8), span(1, 0, 0.2, 1.0)]);
        let mut edges: Vec<f32> = Vec::new();
        for sub in &subs {
            edges.push(sub.start.beat());
            edges.push(sub.end.beat());
        }
        edges.sort_by(|a, b| a.partial_cmp(b).unwrap());
        edges.dedup_by(|a, b| almost_equal(*a, *b));
        assert_eq!(edges.len(), 4, "expected cut points 0, 0.2, 0.8, 1.0");
        // Every adjacent pair of cut points is covered by the right number
        // of fragments.
        for window in edges.windows(2) {
            let mid = (window[0] + window[1]) / 2.0;
            let covering: Vec<_> = subs
                .iter()
                .filter(|s| s.start.beat() < mid && s.end.beat() > mid)
                .collect();
            for sub in &covering {
                assert_eq!(sub.subindices, covering.len());
            }
            let mut idxs: Vec<_> = covering.iter().map(|s| s.subindex).collect();
            idxs.sort_unstable();
            idxs.dedup();
            assert_eq!(idxs.len(), covering.len(), "sub-lane collision at {}", mid);
        }
    }

    #[test]
    fn test_near_coincident_starts_coalesce() {
        // Two spans starting 5 millibeats apart (inside the default slack)
        // must be packed in a single step: no sliver fragment at 0.005.
        let subs = subindex(&[span(0, 0, 0.0, 1.0), span(1, 0, 0.005, 1.0)]);
        assert_eq!(subs.len(), 2, "got {:?}", subs);
        for sub in &subs {
            assert_eq!(sub.subindices, 2);
            assert!(sub.first && sub.last);
        }
    }

    #[test]
    fn test_open_ended_span() {
        let open = Span {
            id: 0,
            pos: 0,
            start: Time::on_beat(0.0),
            end: Time::on_beat(0.0) + Beats::forever(),
        };
        let subs = subindex(&[open]);
        assert_eq!(subs.len(), 1);
        assert!(subs[0].end.beat().is_infinite());
        assert!(subs[0].first && subs[0].last);
    }

    #[test]
    fn test_three_way_overlap_ids_sorted() {
        // Three concurrent spans: sub-lanes assigned by ascending id.
        let subs = subindex(&[
            span(2, 0, 0.0, 1.0),
            span(0, 0, 0.0, 1.0),
            span(1, 0, 0.0, 1.0),
        ]);
        assert_eq!(subs.len(), 3);
        for sub in &subs {
            assert_eq!(sub.subindices, 3);
            assert_eq!(sub.subindex, sub.id, "sub-lane follows id order");
        }
    }

    #[test]
    fn test_custom_slack_splits_when_small() {
        // With a tiny slack the 5-millibeat stagger is a real split.
        let subs = subindex_with_slack(
            &[span(0, 0, 0.0, 1.0), span(1, 0, 0.005, 1.0)],
            Beats(0.001),
        );
        assert!(subs.len() > 2, "expected a split, got {:?}", subs);
    }
}
