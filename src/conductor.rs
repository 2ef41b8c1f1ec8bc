use crate::artifact::{Artifact, Rgba};
use crate::beat::{Beats, Pulse};
use crate::header::Header;
use crate::note::Note;
use crate::trail::Trail;
use crossbeam_channel::{bounded, select, tick, Sender};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Assigns stable small ids to instrument/layer names in order of first
/// appearance.
#[derive(Default)]
pub struct Mapper {
    name_to_id: HashMap<String, usize>,
}

impl Mapper {
    pub fn new() -> Self {
        Mapper::default()
    }

    pub fn get(&mut self, name: &str) -> usize {
        let next = self.name_to_id.len();
        *self.name_to_id.entry(name.to_string()).or_insert(next)
    }
}

/// A header strip plus the trail scrolling beneath it.
pub struct Track {
    pub header: Header,
    pub trail: Trail,
    mapper: Mutex<Mapper>,
}

impl Track {
    fn new(header: Header, trail: Trail) -> Self {
        Track {
            header,
            trail,
            mapper: Mutex::new(Mapper::new()),
        }
    }

    fn map(&self, name: &str) -> usize {
        self.mapper.lock().unwrap().get(name)
    }

    /// Keep the header consistent with the trail: range follows the lane
    /// extent, lit keys follow the sounding spans, and a changed highlight
    /// propagates down into the trail grid.
    pub fn resolve(&self) {
        let (min, max) = self.trail.extent();
        self.header.set_range(min, max);
        self.header.set_active(self.trail.active_pos());
        if let Some(highlight) = self.header.take_updated_highlight() {
            self.trail.set_highlight(highlight);
        }
    }

    pub fn width(&self) -> f32 {
        self.header.width().max(self.trail.width())
    }

    pub fn height(&self) -> f32 {
        self.header.height() + self.trail.length_px()
    }

    fn draw(&self, frame: &mut Artifact, x_off: i32) {
        let header_h = self.header.height();
        for bucket in self.trail.draw() {
            let y = header_h + bucket.offset;
            frame.blit(&bucket.artifact, x_off, y.round() as i32);
        }
        self.header.draw(frame, x_off, 0);
    }
}

/// The top-level instrument state: three side-by-side tracks sharing one
/// beat clock, driven by decoded control messages and rendered into frames.
pub struct Conductor {
    pulse: Arc<Pulse>,
    pub keyboard: Track,
    pub drums: Track,
    pub layers: Track,
    variant_mappers: Mutex<HashMap<usize, Mapper>>,
}

impl Conductor {
    pub fn new(bpm: f32) -> Self {
        info!("Creating conductor at {} bpm", bpm);
        let pulse = Arc::new(Pulse::new(bpm));

        let keyboard = Track::new(
            Header::new(15.0, 30.0, true),
            Trail::new(pulse.clone(), Beats(1.0), Beats(8.0), 64.0, 15.0),
        );
        let drums = Track::new(
            Header::new(30.0, 30.0, false),
            Trail::new(pulse.clone(), Beats(1.0), Beats(8.0), 64.0, 30.0),
        );
        let layers = Track::new(
            Header::new(30.0, 30.0, false),
            Trail::new(pulse.clone(), Beats(8.0), Beats(64.0), 8.0, 30.0),
        );
        drums.header.set_border_width(2.0);
        drums.trail.set_border_width(2.0);
        layers.header.set_border_width(2.0);
        layers.trail.set_border_width(2.0);

        Conductor {
            pulse,
            keyboard,
            drums,
            layers,
            variant_mappers: Mutex::new(HashMap::new()),
        }
    }

    pub fn pulse(&self) -> &Arc<Pulse> {
        &self.pulse
    }

    // ─── Incoming events ────────────────────────────────────────────────────

    /// A note starts on the keyboard track. Zero duration means "until a
    /// matching stop arrives".
    pub fn play_note(&self, instrument: &str, note: Note, duration: Beats) {
        let id = self.keyboard.map(instrument);
        let duration = if duration.is_zero() {
            Beats::forever()
        } else {
            duration
        };
        self.keyboard.trail.span(id, note.pos(), duration);
    }

    pub fn stop_note(&self, instrument: &str, note: Note) {
        let id = self.keyboard.map(instrument);
        self.keyboard.trail.stop(id, note.pos());
    }

    /// A drum hit: one lane per instrument. Zero duration becomes a short
    /// visible blip.
    pub fn play_drum(&self, instrument: &str, duration: Beats) {
        let id = self.drums.map(instrument);
        let duration = if duration.is_zero() {
            Beats(0.125)
        } else {
            duration
        };
        self.drums.trail.span(id, id as i32, duration);
    }

    /// A layer activation: one lane per layer name, colored by variant.
    /// Variant ids are scoped to their layer so each lane starts from the
    /// first palette color.
    pub fn play_layer(&self, name: &str, duration: Beats, variant: &str) {
        let lane = self.layers.map(name);
        let variant_id = self
            .variant_mappers
            .lock()
            .unwrap()
            .entry(lane)
            .or_default()
            .get(variant);
        self.layers.trail.span(variant_id, lane as i32, duration);
    }

    pub fn sync(&self, bpm: f32) {
        debug!("Sync to {} bpm", bpm);
        self.pulse.sync(bpm);
    }

    pub fn toggle_frozen(&self) {
        self.pulse.toggle_frozen();
        info!(
            "Trails {}",
            if self.pulse.is_frozen() { "frozen" } else { "unfrozen" }
        );
    }

    pub fn set_grid_steps(&self, steps: u32) {
        self.keyboard.trail.set_grid_steps(steps);
        self.drums.trail.set_grid_steps(steps);
    }

    pub fn set_highlight(&self, notes: Vec<i32>) {
        self.keyboard.header.set_highlight(notes);
    }

    // ─── Rendering ──────────────────────────────────────────────────────────

    pub fn resolve(&self) {
        self.keyboard.resolve();
        self.drums.resolve();
        self.layers.resolve();
    }

    /// Render one full frame: the three tracks side by side on black.
    pub fn render_frame(&self) -> Artifact {
        self.resolve();
        let tracks = [&self.keyboard, &self.drums, &self.layers];
        let width: f32 = tracks.iter().map(|t| t.width()).sum();
        let height = tracks.iter().map(|t| t.height()).fold(0.0, f32::max);
        let mut frame = Artifact::new(
            width.round().max(1.0) as u32,
            height.round().max(1.0) as u32,
        );
        frame.clear(Rgba::BLACK);

        let mut x = 0.0f32;
        for track in tracks {
            track.draw(&mut frame, x.round() as i32);
            x += track.width();
        }
        frame
    }

    fn cleanup(&self) {
        self.keyboard.trail.cleanup();
        self.drums.trail.cleanup();
        self.layers.trail.cleanup();
    }
}

// ─── Janitor: periodic cleanup ──────────────────────────────────────────────

/// Handle to the background cleanup thread. Dropping the conductor does not
/// leak the thread: it holds only a weak reference and exits when either the
/// conductor is gone or `stop` is called.
pub struct Janitor {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl Janitor {
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Janitor thread panicked");
        }
    }
}

pub fn spawn_janitor(conductor: &Arc<Conductor>, period: Duration) -> Janitor {
    let weak: Weak<Conductor> = Arc::downgrade(conductor);
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let ticker = tick(period);

    let handle = thread::Builder::new()
        .name("janitor".into())
        .spawn(move || loop {
            select! {
                recv(ticker) -> _ => {
                    let Some(conductor) = weak.upgrade() else {
                        debug!("Conductor gone, janitor exiting");
                        break;
                    };
                    debug!("Starting cleanup");
                    conductor.cleanup();
                }
                recv(stop_rx) -> _ => {
                    debug!("Janitor stopping");
                    break;
                }
            }
        })
        .expect("failed to spawn janitor thread");

    Janitor { stop_tx, handle }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    // 60000 bpm: beat durations in tests map to milliseconds.
    fn fast_conductor() -> Conductor {
        Conductor::new(60_000.0)
    }

    #[test]
    fn test_mapper_assigns_stable_ids() {
        let mut mapper = Mapper::new();
        assert_eq!(mapper.get("piano"), 0);
        assert_eq!(mapper.get("bass"), 1);
        assert_eq!(mapper.get("piano"), 0);
        assert_eq!(mapper.get("lead"), 2);
    }

    #[test]
    fn test_play_note_until_stopped() {
        let conductor = fast_conductor();
        let note: Note = "c4".parse().unwrap();
        conductor.play_note("piano", note, Beats(0.0));
        assert_eq!(conductor.keyboard.trail.active_pos(), vec![48]);

        conductor.stop_note("piano", note);
        thread::sleep(StdDuration::from_millis(5));
        assert!(conductor.keyboard.trail.active_pos().is_empty());
    }

    #[test]
    fn test_drum_hit_gets_short_duration() {
        let conductor = fast_conductor();
        conductor.play_drum("kick", Beats(0.0));
        conductor.play_drum("snare", Beats(0.0));
        // One lane per instrument, in mapping order.
        assert_eq!(conductor.drums.trail.active_pos(), vec![0, 1]);

        thread::sleep(StdDuration::from_millis(10));
        assert!(conductor.drums.trail.active_pos().is_empty(), "hits expire on their own");
    }

    #[test]
    fn test_layer_variants_scoped_per_layer() {
        let conductor = fast_conductor();
        conductor.play_layer("arp", Beats(100.0), "a");
        conductor.play_layer("pads", Beats(100.0), "x");
        assert_eq!(conductor.layers.trail.active_pos(), vec![0, 1]);

        // Each layer's first variant gets id 0 regardless of other layers.
        let mappers = conductor.variant_mappers.lock().unwrap();
        assert_eq!(mappers.get(&0).unwrap().name_to_id.get("a"), Some(&0));
        assert_eq!(mappers.get(&1).unwrap().name_to_id.get("x"), Some(&0));
    }

    #[test]
    fn test_sync_reaches_shared_pulse() {
        let conductor = Conductor::new(120.0);
        conductor.sync(150.0);
        assert!((conductor.pulse().bpm() - 150.0).abs() < 1e-3);
    }

    #[test]
    fn test_resolve_syncs_header_to_trail() {
        let conductor = fast_conductor();
        conductor.play_note("piano", "c4".parse().unwrap(), Beats(100.0));
        conductor.play_note("piano", "c5".parse().unwrap(), Beats(100.0));
        conductor.resolve();
        assert_eq!(conductor.keyboard.header.width(), 13.0 * 15.0);
    }

    #[test]
    fn test_render_frame_covers_all_tracks() {
        let conductor = fast_conductor();
        conductor.play_note("piano", "c4".parse().unwrap(), Beats(50.0));
        conductor.play_drum("kick", Beats(50.0));
        conductor.play_layer("arp", Beats(50.0), "a");
        let frame = conductor.render_frame();

        // One lane each: 15 + 30 + 30 wide, keyboard track tallest.
        assert_eq!(frame.width(), 75);
        assert_eq!(frame.height(), 30 + 8 * 64);
    }

    #[test]
    fn test_janitor_stops_cleanly() {
        let conductor = Arc::new(fast_conductor());
        conductor.play_note("piano", "c4".parse().unwrap(), Beats(1.0));
        let janitor = spawn_janitor(&conductor, StdDuration::from_millis(5));
        thread::sleep(StdDuration::from_millis(30));
        janitor.stop();
        assert!(
            conductor.keyboard.trail.active_pos().is_empty(),
            "janitor ran cleanup while alive"
        );
    }

    #[test]
    fn test_janitor_exits_when_conductor_dropped() {
        let conductor = Arc::new(fast_conductor());
        let janitor = spawn_janitor(&conductor, StdDuration::from_millis(5));
        drop(conductor);
        thread::sleep(StdDuration::from_millis(20));
        assert!(janitor.handle.is_finished());
        janitor.stop();
    }
}
