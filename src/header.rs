use crate::artifact::{Artifact, Rgba};
use crate::note::Note;
use log::debug;
use std::sync::Mutex;

const WHITE: Rgba = Rgba::rgb(0xb7, 0x9a, 0x9a);
const WHITE_HIGHLIGHT: Rgba = Rgba::rgb(0xda, 0xbf, 0xbf);
const WHITE_ACTIVE: Rgba = Rgba::rgb(0xfd, 0xe5, 0xe5);
const BLACK: Rgba = Rgba::rgb(0x18, 0x11, 0x11);
const BLACK_HIGHLIGHT: Rgba = Rgba::rgb(0x38, 0x2a, 0x2a);
const BLACK_ACTIVE: Rgba = Rgba::rgb(0x59, 0x44, 0x44);
const BORDER: Rgba = Rgba::BLACK;

/// The fixed strip above a trail: piano keys or plain pads, lighting up for
/// active lanes. Rendered as a cached base (idle keys) plus an overlay
/// (highlight and active keys) composited on demand.
pub struct Header {
    state: Mutex<HeaderState>,
}

struct HeaderState {
    min: i32,
    max: i32,
    active: Vec<i32>,
    highlight: Vec<i32>,
    highlight_delivered: bool,

    keyboard: bool,
    key_width: f32,
    key_height: f32,
    border_width: f32,

    base: Option<Artifact>,
    overlay: Option<Artifact>,
    overlay_ready: bool,
}

impl Header {
    pub fn new(key_width: f32, key_height: f32, keyboard: bool) -> Self {
        Header {
            state: Mutex::new(HeaderState {
                min: 0,
                max: 0,
                active: Vec::new(),
                highlight: Vec::new(),
                highlight_delivered: true,
                keyboard,
                key_width,
                key_height,
                border_width: 2.0,
                base: None,
                overlay: None,
                overlay_ready: false,
            }),
        }
    }

    pub fn set_border_width(&self, width: f32) {
        let mut st = self.state.lock().unwrap();
        st.border_width = width;
        st.base = None;
        st.overlay_ready = false;
    }

    pub fn set_range(&self, min: i32, max: i32) {
        let mut st = self.state.lock().unwrap();
        if st.min != min || st.max != max {
            st.min = min;
            st.max = max;
            st.base = None;
            st.overlay = None;
            st.overlay_ready = false;
        }
    }

    pub fn set_active(&self, active: Vec<i32>) {
        let mut st = self.state.lock().unwrap();
        if st.active != active {
            st.active = active;
            st.overlay_ready = false;
        }
    }

    pub fn set_highlight(&self, highlight: Vec<i32>) {
        let mut st = self.state.lock().unwrap();
        if st.highlight != highlight {
            st.highlight = highlight;
            st.overlay_ready = false;
            st.highlight_delivered = false;
        }
    }

    /// The highlight set, once per change. Lets the owning track forward a
    /// new highlight to its trail without diffing on every frame.
    pub fn take_updated_highlight(&self) -> Option<Vec<i32>> {
        let mut st = self.state.lock().unwrap();
        if st.highlight_delivered {
            return None;
        }
        st.highlight_delivered = true;
        Some(st.highlight.clone())
    }

    pub fn width(&self) -> f32 {
        let st = self.state.lock().unwrap();
        (st.max - st.min + 1) as f32 * st.key_width
    }

    pub fn height(&self) -> f32 {
        self.state.lock().unwrap().key_height
    }

    /// Composite the header into `frame` at the given offset.
    pub fn draw(&self, frame: &mut Artifact, x_off: i32, y_off: i32) {
        let mut st = self.state.lock().unwrap();
        st.refresh();
        if let Some(base) = &st.base {
            frame.blit(base, x_off, y_off);
        }
        if let Some(overlay) = &st.overlay {
            frame.blit(overlay, x_off, y_off);
        }
    }
}

impl HeaderState {
    fn image_size(&self) -> (u32, u32) {
        let w = (self.key_width * (self.max - self.min + 1) as f32).round();
        let h = self.key_height.round();
        (w.max(1.0) as u32, h.max(1.0) as u32)
    }

    fn refresh(&mut self) {
        let (w, h) = self.image_size();

        if self.base.is_none() {
            debug!("New header base image");
            let mut base = Artifact::new(w, h);
            base.clear(BORDER);
            for note in self.min..=self.max {
                if self.keyboard {
                    draw_key(&mut base, self, note, false, false);
                } else {
                    draw_pad(&mut base, self, note, false);
                }
            }
            self.base = Some(base);
        }

        if !self.overlay_ready {
            let mut overlay = match self.overlay.take() {
                Some(img) if img.width() == w && img.height() == h => img,
                _ => Artifact::new(w, h),
            };
            overlay.clear(Rgba::TRANSPARENT);

            for i in 0..self.highlight.len() {
                let note = self.highlight[i];
                if self.keyboard {
                    draw_key(&mut overlay, self, note, false, true);
                } else {
                    debug!("Pads have no highlighting");
                }
            }
            for i in 0..self.active.len() {
                let note = self.active[i];
                if self.keyboard {
                    draw_key(&mut overlay, self, note, true, false);
                } else {
                    draw_pad(&mut overlay, self, note, true);
                }
            }

            self.overlay = Some(overlay);
            self.overlay_ready = true;
        }
    }
}

/// One piano key. White keys widen above the black-key row toward any
/// missing black neighbor; the first and last keys keep a full border.
fn draw_key(img: &mut Artifact, st: &HeaderState, note: i32, active: bool, highlight: bool) {
    let half_border = st.border_width / 2.0;
    let half_width = st.key_width / 2.0;
    let black_height = st.key_height * 0.25;

    let base = (note - st.min) as f32 * st.key_width;
    let mut key_off = base + half_border;
    let mut key_end = base + st.key_width - half_border;
    let mut left_black = !Note(note - 1).is_white();
    let mut right_black = !Note(note + 1).is_white();
    if note == st.min {
        key_off += half_border;
        left_black = false;
    }
    if note == st.max {
        key_end -= half_border;
        right_black = false;
    }

    let white = Note(note).is_white();
    let color = match (white, active, highlight) {
        (true, true, _) => WHITE_ACTIVE,
        (true, false, true) => WHITE_HIGHLIGHT,
        (true, false, false) => WHITE,
        (false, true, _) => BLACK_ACTIVE,
        (false, false, true) => BLACK_HIGHLIGHT,
        (false, false, false) => BLACK,
    };

    if white {
        img.fill_rect(
            key_off,
            st.border_width,
            key_end,
            st.key_height - st.border_width,
            color,
        );
        if left_black {
            img.fill_rect(
                key_off - half_width,
                st.border_width,
                key_off,
                black_height - half_border,
                color,
            );
        }
        if right_black {
            img.fill_rect(
                key_end,
                st.border_width,
                key_end + half_width,
                black_height - half_border,
                color,
            );
        }
    } else {
        img.fill_rect(
            key_off,
            black_height + half_border,
            key_end,
            st.key_height - st.border_width,
            color,
        );
    }
}

/// One plain rectangular pad.
fn draw_pad(img: &mut Artifact, st: &HeaderState, pos: i32, active: bool) {
    let half_border = st.border_width / 2.0;
    let base = (pos - st.min) as f32 * st.key_width;
    let color = if active { WHITE_ACTIVE } else { WHITE };
    img.fill_rect(
        base + half_border,
        st.border_width,
        base + st.key_width - half_border,
        st.key_height - st.border_width,
        color,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(frame: &Artifact, x: u32, y: u32) -> [u8; 4] {
        let at = ((y * frame.width() + x) * 4) as usize;
        frame.pixels()[at..at + 4].try_into().unwrap()
    }

    fn rgba(c: Rgba) -> [u8; 4] {
        [c.r, c.g, c.b, c.a]
    }

    #[test]
    fn test_width_follows_range() {
        let header = Header::new(15.0, 30.0, true);
        assert_eq!(header.width(), 15.0);
        header.set_range(48, 59);
        assert_eq!(header.width(), 12.0 * 15.0);
    }

    #[test]
    fn test_keyboard_key_colors() {
        let header = Header::new(16.0, 32.0, true);
        header.set_range(48, 59); // c4..b4
        let mut frame = Artifact::new(12 * 16, 32);
        header.draw(&mut frame, 0, 0);

        // Center-bottom of the first key (c4, white).
        assert_eq!(pixel(&frame, 8, 28), rgba(WHITE));
        // Center-bottom of the second key (cs4, black).
        assert_eq!(pixel(&frame, 24, 28), rgba(BLACK));
        // Top row is border.
        assert_eq!(pixel(&frame, 8, 0), rgba(BORDER));
    }

    #[test]
    fn test_active_key_lights_up() {
        let header = Header::new(16.0, 32.0, true);
        header.set_range(48, 59);
        header.set_active(vec![48]);
        let mut frame = Artifact::new(12 * 16, 32);
        header.draw(&mut frame, 0, 0);
        assert_eq!(pixel(&frame, 8, 28), rgba(WHITE_ACTIVE));

        header.set_active(vec![]);
        header.draw(&mut frame, 0, 0);
        assert_eq!(pixel(&frame, 8, 28), rgba(WHITE), "overlay refreshed on change");
    }

    #[test]
    fn test_highlight_key_shading() {
        let header = Header::new(16.0, 32.0, true);
        header.set_range(48, 59);
        header.set_highlight(vec![50]); // d4, white
        let mut frame = Artifact::new(12 * 16, 32);
        header.draw(&mut frame, 0, 0);
        assert_eq!(pixel(&frame, 40, 28), rgba(WHITE_HIGHLIGHT));
    }

    #[test]
    fn test_white_key_widens_over_missing_black() {
        let header = Header::new(16.0, 32.0, true);
        header.set_range(48, 52); // c4..e4
        let mut frame = Artifact::new(5 * 16, 32);
        header.draw(&mut frame, 0, 0);
        // d4 (index 2) has black neighbors on both sides: its body stays
        // narrow while its top section widens over both of them.
        assert_eq!(pixel(&frame, 2 * 16 + 8, 4), rgba(WHITE), "d4 top center");
        assert_eq!(pixel(&frame, 2 * 16 - 4, 4), rgba(WHITE), "d4 top reaches left");
        assert_eq!(pixel(&frame, 2 * 16 - 4, 20), rgba(BLACK), "cs4 body");
    }

    #[test]
    fn test_pads_ignore_highlight() {
        let header = Header::new(30.0, 30.0, false);
        header.set_range(0, 3);
        header.set_highlight(vec![1]);
        header.set_active(vec![2]);
        let mut frame = Artifact::new(4 * 30, 30);
        header.draw(&mut frame, 0, 0);
        assert_eq!(pixel(&frame, 45, 15), rgba(WHITE), "highlight has no effect on pads");
        assert_eq!(pixel(&frame, 75, 15), rgba(WHITE_ACTIVE));
    }

    #[test]
    fn test_take_updated_highlight_once() {
        let header = Header::new(15.0, 30.0, true);
        assert_eq!(header.take_updated_highlight(), None);
        header.set_highlight(vec![48, 50]);
        assert_eq!(header.take_updated_highlight(), Some(vec![48, 50]));
        assert_eq!(header.take_updated_highlight(), None);
        header.set_highlight(vec![48, 50]);
        assert_eq!(header.take_updated_highlight(), None, "unchanged set not redelivered");
    }
}
