use crate::beat::{Time, VISUAL_SLACK};
use std::fmt;

/// One timed occurrence in a lane: a note, drum hit, or layer activation.
/// `end` may be far in the future (open-ended) until a stop arrives; it is
/// mutated at most once, in place, by that stop.
#[derive(Debug, Clone, Copy)]
pub struct Span {
    /// Instrument or other category id (within the same lane).
    pub id: usize,
    /// Lane on the timeline.
    pub pos: i32,
    pub start: Time,
    pub end: Time,
}

impl Span {
    pub fn in_range(&self, start: Time, end: Time) -> bool {
        !self.end.before(start) && !self.start.after(end)
    }

    /// Like `in_range` but shrunk by the visual slack, so spans that only
    /// graze a window are not considered overlapping for packing purposes.
    pub fn in_visual_range(&self, start: Time, end: Time) -> bool {
        !self.end.before(start + VISUAL_SLACK) && !self.start.after(end - VISUAL_SLACK)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} [{:.2}:{:.2}]",
            self.id,
            self.pos,
            self.start.beat(),
            self.end.beat()
        )
    }
}

/// Spans grouped into one fixed-width window of beat time.
#[derive(Debug)]
pub struct SpanBucket {
    pub start: Time,
    /// Maximum `end` among contained spans; recomputed by `update_end` after
    /// a span inside shrinks.
    pub end: Time,
    pub spans: Vec<Span>,
}

impl SpanBucket {
    pub fn new(start: Time, end: Time) -> Self {
        SpanBucket {
            start,
            end,
            spans: Vec::new(),
        }
    }

    pub fn in_range(&self, start: Time, end: Time) -> bool {
        !self.end.before(start) && !self.start.after(end)
    }

    pub fn update_end(&mut self) {
        let mut latest = Time::default();
        for span in &self.spans {
            if span.end.after(latest) {
                latest = span.end;
            }
        }
        self.end = latest;
    }

    /// Checks that every span's start lies within the bucket bounds. A
    /// violation means the bucket is corrupt; callers log and skip it rather
    /// than aborting.
    pub fn validate(&self) -> Result<(), String> {
        for span in &self.spans {
            if span.start.before(self.start)
                || span.start.after(self.end)
                || span.end.before(self.start)
            {
                return Err(format!(
                    "span {} outside bucket [{}:{}]",
                    span, self.start, self.end
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beat::Beats;

    fn span(id: usize, pos: i32, start: f32, end: f32) -> Span {
        Span {
            id,
            pos,
            start: Time::on_beat(start),
            end: Time::on_beat(end),
        }
    }

    #[test]
    fn test_span_in_range() {
        let s = span(0, 0, 1.0, 2.0);
        assert!(s.in_range(Time::on_beat(0.0), Time::on_beat(1.5)));
        assert!(s.in_range(Time::on_beat(1.5), Time::on_beat(1.5)));
        assert!(s.in_range(Time::on_beat(2.0), Time::on_beat(3.0)));
        assert!(!s.in_range(Time::on_beat(2.1), Time::on_beat(3.0)));
        assert!(!s.in_range(Time::on_beat(0.0), Time::on_beat(0.9)));
    }

    #[test]
    fn test_span_in_visual_range_shrinks_window() {
        let s = span(0, 0, 1.0, 2.0);
        // Barely touching at the edge is not a visual overlap.
        assert!(!s.in_visual_range(Time::on_beat(2.0), Time::on_beat(3.0)));
        assert!(s.in_visual_range(Time::on_beat(1.9), Time::on_beat(3.0)));
    }

    #[test]
    fn test_open_ended_span_in_range() {
        let s = Span {
            id: 0,
            pos: 0,
            start: Time::on_beat(1.0),
            end: Time::on_beat(1.0) + Beats::forever(),
        };
        assert!(s.in_range(Time::on_beat(1000.0), Time::on_beat(1001.0)));
    }

    #[test]
    fn test_bucket_update_end() {
        let mut bucket = SpanBucket::new(Time::on_beat(0.0), Time::on_beat(0.0));
        bucket.spans.push(span(0, 0, 0.1, 0.5));
        bucket.spans.push(span(1, 1, 0.2, 3.0));
        bucket.spans.push(span(2, 2, 0.3, 1.0));
        bucket.update_end();
        assert_eq!(bucket.end, Time::on_beat(3.0));

        // Shrink the longest span; update_end must follow.
        bucket.spans[1].end = Time::on_beat(0.4);
        bucket.update_end();
        assert_eq!(bucket.end, Time::on_beat(1.0));
    }

    #[test]
    fn test_bucket_validate() {
        let mut bucket = SpanBucket::new(Time::on_beat(1.0), Time::on_beat(2.0));
        bucket.spans.push(span(0, 0, 1.2, 1.8));
        assert!(bucket.validate().is_ok());

        bucket.spans.push(span(1, 0, 0.5, 1.5));
        assert!(bucket.validate().is_err());
    }
}
