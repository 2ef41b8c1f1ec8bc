use crate::artifact::Artifact;
use crossbeam_channel::Receiver;
use std::io::{self, Write};
use std::sync::Arc;

/// Renders frames as ANSI true-color half blocks in the terminal, for
/// headless setups and debugging. Each character cell carries two vertically
/// stacked pixels (▀ with independent fore/background colors).
pub struct ConsoleDisplay {
    rx: Receiver<Arc<Artifact>>,
    update_hz: u32,
    max_cols: u32,
}

impl ConsoleDisplay {
    pub fn new(rx: Receiver<Arc<Artifact>>, update_hz: u32) -> Self {
        Self {
            rx,
            update_hz,
            max_cols: 120,
        }
    }

    /// Run the display loop. Blocks until the frame channel closes.
    pub fn run(&self) {
        let skip = if self.update_hz == 0 {
            4
        } else {
            (60 / self.update_hz).max(1) as u64
        };
        let mut count: u64 = 0;
        let mut stdout = io::stdout();

        for frame in self.rx.iter() {
            count += 1;
            if count % skip != 0 {
                continue;
            }
            let text = render(&frame, self.max_cols);
            // Cursor home without clearing, to avoid flicker.
            let _ = write!(stdout, "\x1b[H{}\x1b[0m", text);
            let _ = stdout.flush();
        }
    }
}

/// Integer factor that brings `width` under `max_cols` columns.
fn downsample_factor(width: u32, max_cols: u32) -> u32 {
    let mut factor = 1;
    while width / factor > max_cols {
        factor += 1;
    }
    factor
}

/// Average color of the `factor`×`factor` block at (x, y) in block
/// coordinates.
fn sample(frame: &Artifact, x: u32, y: u32, factor: u32) -> (u8, u8, u8) {
    let mut r: u32 = 0;
    let mut g: u32 = 0;
    let mut b: u32 = 0;
    let mut n: u32 = 0;
    for dy in 0..factor {
        let py = y * factor + dy;
        if py >= frame.height() {
            break;
        }
        for dx in 0..factor {
            let px = x * factor + dx;
            if px >= frame.width() {
                break;
            }
            let at = ((py * frame.width() + px) * 4) as usize;
            r += frame.pixels()[at] as u32;
            g += frame.pixels()[at + 1] as u32;
            b += frame.pixels()[at + 2] as u32;
            n += 1;
        }
    }
    if n == 0 {
        return (0, 0, 0);
    }
    ((r / n) as u8, (g / n) as u8, (b / n) as u8)
}

fn render(frame: &Artifact, max_cols: u32) -> String {
    let factor = downsample_factor(frame.width(), max_cols);
    let cols = frame.width() / factor;
    let rows = frame.height() / factor;

    let mut out = String::new();
    let mut y = 0;
    while y < rows {
        for x in 0..cols {
            let (tr, tg, tb) = sample(frame, x, y, factor);
            let (br, bg, bb) = if y + 1 < rows {
                sample(frame, x, y + 1, factor)
            } else {
                (0, 0, 0)
            };
            out.push_str(&format!(
                "\x1b[38;2;{};{};{}m\x1b[48;2;{};{};{}m▀",
                tr, tg, tb, br, bg, bb
            ));
        }
        out.push_str("\x1b[0m\n");
        y += 2;
    }
    out
}
