use crate::artifact::{Artifact, ArtifactPool, Rgba, SPAN_PALETTE};
use crate::beat::{Beats, Pulse, Time, VISUAL_SLACK};
use crate::note::Note;
use crate::span::{Span, SpanBucket};
use crate::subindex::{subindex_with_slack, SubSpan};
use log::{debug, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

// Background grid shades: octave boundary, white key, black key, and the
// highlighted variant of each.
const GRID_OCTAVE: Rgba = Rgba::rgb(0x30, 0x30, 0x30);
const GRID_WHITE: Rgba = Rgba::rgb(0x20, 0x20, 0x20);
const GRID_BLACK: Rgba = Rgba::rgb(0x10, 0x10, 0x10);
const GRID_OCTAVE_HL: Rgba = Rgba::rgb(0x48, 0x3a, 0x3a);
const GRID_WHITE_HL: Rgba = Rgba::rgb(0x38, 0x2c, 0x2c);
const GRID_BLACK_HL: Rgba = Rgba::rgb(0x28, 0x1e, 0x1e);
const GRID_LINE_MAJOR: Rgba = Rgba::rgb(0xc0, 0xc0, 0xc0);
const GRID_LINE_MINOR: Rgba = Rgba::rgb(0x80, 0x80, 0x80);

/// One compositing instruction for the external presenter: draw `artifact`
/// with its top edge at `offset` pixels below the horizon line.
pub struct BucketDraw {
    pub artifact: Arc<Artifact>,
    pub offset: f32,
}

/// The scrolling timeline: a bucketed span store, the lane-packing pass, and
/// a per-bucket artifact cache with pooled reuse. Ingestion, rendering, and
/// cleanup may run on different threads; all state is behind one lock.
pub struct Trail {
    pulse: Arc<Pulse>,
    state: Mutex<TrailState>,
}

struct TrailState {
    bucket_size: Beats,
    length: Beats,
    /// Pixels per beat, vertically.
    beat_size: f32,
    /// Pixels per lane, horizontally.
    pos_width: f32,
    border_width: f32,
    grid_steps: u32,
    slack: Beats,

    buckets: BTreeMap<i64, SpanBucket>,
    /// Observed lane extent. Widening is a full invalidation event: the
    /// per-lane pixel width of every cached image changes.
    min_pos: i32,
    max_pos: i32,
    /// (bucket key, index within bucket) of spans that may still be sounding.
    /// Pruned lazily, only inside `active_pos`.
    active: Vec<(i64, usize)>,
    /// Lanes to shade in the background grid. Sorted.
    highlight: Vec<i32>,

    cached: HashMap<i64, Arc<Artifact>>,
    cached_ready: HashSet<i64>,
    grid: Option<Arc<Artifact>>,
    grid_ready: bool,
    pool: ArtifactPool,
}

impl Trail {
    pub fn new(
        pulse: Arc<Pulse>,
        bucket_size: Beats,
        length: Beats,
        beat_size: f32,
        pos_width: f32,
    ) -> Self {
        debug!("New trail: bucket={} length={}", bucket_size, length);
        Trail {
            pulse,
            state: Mutex::new(TrailState {
                bucket_size,
                length,
                beat_size,
                pos_width,
                border_width: 1.0,
                grid_steps: 4,
                slack: VISUAL_SLACK,
                buckets: BTreeMap::new(),
                min_pos: 0,
                max_pos: 0,
                active: Vec::new(),
                highlight: Vec::new(),
                cached: HashMap::new(),
                cached_ready: HashSet::new(),
                grid: None,
                grid_ready: false,
                pool: ArtifactPool::new(),
            }),
        }
    }

    pub fn set_border_width(&self, width: f32) {
        let mut st = self.state.lock().unwrap();
        st.border_width = width;
        st.redraw_all();
    }

    /// Tune the coalescing slack used by lane packing.
    pub fn set_slack(&self, slack: Beats) {
        let mut st = self.state.lock().unwrap();
        st.slack = slack;
        st.redraw_all();
    }

    /// Record a new span starting now. A lane outside the observed extent
    /// widens it and invalidates every cached artifact.
    pub fn span(&self, id: usize, pos: i32, duration: Beats) {
        let now = self.pulse.now();
        let mut st = self.state.lock().unwrap();

        let id = if id >= SPAN_PALETTE.len() {
            warn!("Category id {} beyond palette, wrapping", id);
            id % SPAN_PALETTE.len()
        } else {
            id
        };

        if st.buckets.is_empty() {
            st.min_pos = pos;
            st.max_pos = pos;
            st.reset_all();
        } else if pos < st.min_pos {
            st.min_pos = pos;
            st.reset_all();
        } else if pos > st.max_pos {
            st.max_pos = pos;
            st.reset_all();
        }

        let key = now.bucket_index(st.bucket_size);
        st.cached_ready.remove(&key);

        let span = Span {
            id,
            pos,
            start: now,
            end: now + duration,
        };
        let bucket_start = Time::of_bucket(key, st.bucket_size);
        let bucket = st
            .buckets
            .entry(key)
            .or_insert_with(|| SpanBucket::new(bucket_start, span.end));
        if span.end.after(bucket.end) {
            bucket.end = span.end;
        }
        let idx = bucket.spans.len();
        bucket.spans.push(span);
        st.active.push((key, idx));
    }

    /// Terminate the most recently started open span matching `(id, pos)`.
    /// A stop with no matching open span is a no-op: the source may send a
    /// stop for an event that already finished naturally.
    pub fn stop(&self, id: usize, pos: i32) {
        let now = self.pulse.now();
        let mut st = self.state.lock().unwrap();
        let id = id % SPAN_PALETTE.len();

        let mut best: Option<(i64, usize, Time)> = None;
        for (&key, bucket) in &st.buckets {
            if bucket.end.before(now) {
                continue;
            }
            for (idx, span) in bucket.spans.iter().enumerate() {
                if span.id != id || span.pos != pos || !span.end.after(now) {
                    continue;
                }
                let better = match best {
                    None => true,
                    Some((_, _, start)) => span.start.after(start),
                };
                if better {
                    best = Some((key, idx, span.start));
                }
            }
        }

        let Some((key, idx, _)) = best else {
            return;
        };
        if let Some(bucket) = st.buckets.get_mut(&key) {
            bucket.spans[idx].end = now;
            bucket.update_end();
        }
        let now_key = now.bucket_index(st.bucket_size);
        st.cached_ready.remove(&now_key);
    }

    /// Distinct, sorted lanes with a span still sounding now. The only place
    /// where expired entries leave the active list; cheap enough to call
    /// every frame.
    pub fn active_pos(&self) -> Vec<i32> {
        let now = self.pulse.now();
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let buckets = &st.buckets;
        st.active.retain(|&(key, idx)| {
            let span = match buckets.get(&key).and_then(|b| b.spans.get(idx)) {
                Some(span) => span,
                None => return false,
            };
            if !span.in_range(now, now) {
                return false;
            }
            if seen.insert(span.pos) {
                out.push(span.pos);
            }
            true
        });
        out.sort_unstable();
        out
    }

    pub fn extent(&self) -> (i32, i32) {
        let st = self.state.lock().unwrap();
        (st.min_pos, st.max_pos)
    }

    pub fn set_grid_steps(&self, steps: u32) {
        let mut st = self.state.lock().unwrap();
        st.grid_steps = steps.max(1);
        st.redraw_all();
    }

    pub fn set_highlight(&self, mut lanes: Vec<i32>) {
        lanes.sort_unstable();
        lanes.dedup();
        let mut st = self.state.lock().unwrap();
        if st.highlight != lanes {
            st.highlight = lanes;
            st.redraw_all();
        }
    }

    /// Pixel width of the rendered trail at the current lane extent.
    pub fn width(&self) -> f32 {
        let st = self.state.lock().unwrap();
        (st.max_pos - st.min_pos + 1) as f32 * st.pos_width
    }

    /// Pixel height of the visible trail window.
    pub fn length_px(&self) -> f32 {
        let st = self.state.lock().unwrap();
        st.length.beats() * st.beat_size
    }

    /// Walk buckets from the horizon back to the retention limit, refreshing
    /// stale artifacts along the way, and emit one compositing instruction
    /// per bucket. History (time < horizon) flows away from offset 0.
    pub fn draw(&self) -> Vec<BucketDraw> {
        let horizon = self.pulse.horizon();
        let mut st = self.state.lock().unwrap();

        let bucket_size = st.bucket_size;
        let mut key = horizon.bucket_index(bucket_size);
        let trail_end = horizon - st.length;

        let mut out = Vec::new();
        while Time::of_bucket(key, bucket_size).after(trail_end) {
            let artifact = st.bucket_artifact(key);
            // The bucket image covers [bucket start (bottom) : bucket end
            // (top)]; its top edge sits above the horizon while the bucket
            // is still being filled.
            let bucket_top = Time::of_bucket(key + 1, bucket_size);
            let offset = horizon.delta(bucket_top).beats() * st.beat_size;
            out.push(BucketDraw { artifact, offset });
            key -= 1;
        }
        out
    }

    /// Drop buckets past the retention horizon and retire their cached
    /// artifacts into the pool.
    pub fn cleanup(&self) {
        let horizon = self.pulse.horizon();
        let mut st = self.state.lock().unwrap();
        let st = &mut *st;
        let expiry = horizon - st.length;

        let dead: Vec<i64> = st
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.end.before(expiry))
            .map(|(&key, _)| key)
            .collect();
        for key in dead {
            st.buckets.remove(&key);
        }

        let bucket_size = st.bucket_size;
        let retire: Vec<i64> = st
            .cached
            .keys()
            .copied()
            .filter(|&key| Time::of_bucket(key + 1, bucket_size).before(expiry))
            .collect();
        for key in retire {
            debug!("Retiring artifact for bucket {}", key);
            if let Some(arc) = st.cached.remove(&key) {
                st.pool.release(arc);
            }
            st.cached_ready.remove(&key);
        }
    }
}

impl TrailState {
    fn redraw_all(&mut self) {
        self.cached_ready.clear();
        self.grid_ready = false;
    }

    /// Full invalidation: every artifact goes back to the pool. Readers that
    /// still hold a handle keep it alive; the pool will not recycle such an
    /// entry until they let go.
    fn reset_all(&mut self) {
        for (_, arc) in self.cached.drain() {
            self.pool.release(arc);
        }
        if let Some(arc) = self.grid.take() {
            self.pool.release(arc);
        }
        self.redraw_all();
    }

    fn artifact_size(&self) -> (u32, u32) {
        let w = (self.pos_width * (self.max_pos - self.min_pos + 1) as f32).round();
        let h = (self.bucket_size.beats() * self.beat_size).round();
        (w.max(1.0) as u32, h.max(1.0) as u32)
    }

    /// The cached artifact for one bucket, re-rasterized if stale.
    fn bucket_artifact(&mut self, key: i64) -> Arc<Artifact> {
        if self.cached_ready.contains(&key) {
            if let Some(arc) = self.cached.get(&key) {
                return arc.clone();
            }
        }

        let grid = self.grid_artifact();

        let window_start = Time::of_bucket(key, self.bucket_size);
        let window_end = window_start + self.bucket_size;
        let mut spans: Vec<Span> = Vec::new();
        for bucket in self.buckets.values() {
            if let Err(e) = bucket.validate() {
                warn!("Skipping invalid bucket: {}", e);
                continue;
            }
            if !bucket.in_range(window_start, window_end) {
                continue;
            }
            for span in &bucket.spans {
                if span.in_range(window_start, window_end) {
                    spans.push(*span);
                }
            }
        }
        let subs = subindex_with_slack(&spans, self.slack);

        let mut art = self.take_cached_buffer(key);
        art.copy_from(&grid);
        for sub in &subs {
            if sub.end.before(window_start) || sub.start.after(window_end) {
                continue;
            }
            let (y_start, y_end, x0, x1) = self.sub_span_bounds(window_start, sub);
            if y_start <= y_end {
                debug!("Skipping degenerate fragment for span {}@{}", sub.id, sub.pos);
                continue;
            }
            art.fill_rect(x0, y_end, x1, y_start, SPAN_PALETTE[sub.id % SPAN_PALETTE.len()]);
        }

        let arc = Arc::new(art);
        self.cached.insert(key, arc.clone());
        self.cached_ready.insert(key);
        arc
    }

    /// Take an owned buffer for re-rasterizing `key`: the previously cached
    /// one if nothing else holds it, else a pooled or fresh one.
    fn take_cached_buffer(&mut self, key: i64) -> Artifact {
        let (w, h) = self.artifact_size();
        if let Some(arc) = self.cached.remove(&key) {
            match Arc::try_unwrap(arc) {
                Ok(art) => {
                    if art.width() == w && art.height() == h {
                        return art;
                    }
                }
                Err(arc) => self.pool.release(arc),
            }
        }
        self.pool.acquire(w, h)
    }

    /// The shared background grid, re-rasterized if stale. Depends only on
    /// lane extent, highlight set, bucket size, and grid steps.
    fn grid_artifact(&mut self) -> Arc<Artifact> {
        if self.grid_ready {
            if let Some(arc) = &self.grid {
                return arc.clone();
            }
        }

        let (w, h) = self.artifact_size();
        let mut art = match self.grid.take() {
            Some(arc) => match Arc::try_unwrap(arc) {
                Ok(art) if art.width() == w && art.height() == h => art,
                Ok(_) => self.pool.acquire(w, h),
                Err(arc) => {
                    self.pool.release(arc);
                    self.pool.acquire(w, h)
                }
            },
            None => self.pool.acquire(w, h),
        };

        // Lane columns
        for pos in self.min_pos..=self.max_pos {
            let base = (pos - self.min_pos) as f32 * self.pos_width;
            let highlighted = self.highlight.binary_search(&pos).is_ok();
            let color = if pos.rem_euclid(12) == 0 {
                if highlighted {
                    GRID_OCTAVE_HL
                } else {
                    GRID_OCTAVE
                }
            } else if Note(pos).is_white() {
                if highlighted {
                    GRID_WHITE_HL
                } else {
                    GRID_WHITE
                }
            } else if highlighted {
                GRID_BLACK_HL
            } else {
                GRID_BLACK
            };
            art.fill_rect(base, 0.0, base + self.pos_width, h as f32, color);
        }

        // Timeline rows
        let steps = self.grid_steps.max(1);
        let step_px = h as f32 / steps as f32;
        for i in 0..steps {
            let y = i as f32 * step_px;
            let color = if i == 0 { GRID_LINE_MAJOR } else { GRID_LINE_MINOR };
            art.fill_rect(0.0, y, w as f32, y + self.border_width, color);
        }

        let arc = Arc::new(art);
        self.grid = Some(arc.clone());
        self.grid_ready = true;
        arc
    }

    /// Pixel geometry of one fragment within the image of the bucket
    /// starting at `bucket_time`. Returns (start y, end y, x, end x) with
    /// start below end (y grows toward the past). First/last fragments are
    /// inset by the border to show a cap; adjacent sub-lanes share a
    /// half-border gap; anything shorter than a pixel becomes a 1px sliver.
    fn sub_span_bounds(&self, bucket_time: Time, sub: &SubSpan) -> (f32, f32, f32, f32) {
        let bucket_end = bucket_time + self.bucket_size;
        let h = self.bucket_size.beats() * self.beat_size;
        let border = self.border_width;

        let raw_start = bucket_end.delta(sub.start).beats() * self.beat_size;
        let raw_end = bucket_end.delta(sub.end).beats() * self.beat_size;
        let mut start = if sub.first { raw_start - border } else { raw_start };
        let mut end = if sub.last { raw_end + border } else { raw_end };
        start = start.min(h);
        end = end.max(0.0);
        if start - end < 1.0 {
            start = raw_start.min(h);
            end = start - 1.0;
        }

        let base = (sub.pos - self.min_pos) as f32 * self.pos_width;
        let sub_width = (self.pos_width - 2.0 * border) / sub.subindices as f32;
        let mut offset = base + border + sub.subindex as f32 * sub_width;
        let mut end_offset = base + border + (sub.subindex + 1) as f32 * sub_width;
        if sub.subindex > 0 {
            offset += border / 2.0;
        }
        if sub.subindex + 1 < sub.subindices {
            end_offset -= border / 2.0;
        }

        (start, end, offset, end_offset)
    }
}
