use log::debug;
use std::sync::Arc;

/// 8-bit RGBA color.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgba {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Rgba { r, g, b, a: 0xff }
    }

    pub const TRANSPARENT: Rgba = Rgba {
        r: 0,
        g: 0,
        b: 0,
        a: 0,
    };
    pub const BLACK: Rgba = Rgba::rgb(0, 0, 0);
}

/// Fill colors for span categories, cycled by id.
pub const SPAN_PALETTE: [Rgba; 7] = [
    Rgba::rgb(0x44, 0x77, 0xaa),
    Rgba::rgb(0x66, 0xcc, 0xee),
    Rgba::rgb(0x22, 0x88, 0x33),
    Rgba::rgb(0xcc, 0xbb, 0x44),
    Rgba::rgb(0xee, 0x66, 0x77),
    Rgba::rgb(0xaa, 0x33, 0x77),
    Rgba::rgb(0xbb, 0xbb, 0xbb),
];

/// One rendered, cacheable image: a plain RGBA8 buffer.
#[derive(Debug, Clone)]
pub struct Artifact {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Artifact {
    pub fn new(width: u32, height: u32) -> Self {
        Artifact {
            width,
            height,
            pixels: vec![0; (width * height * 4) as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn clear(&mut self, color: Rgba) {
        for px in self.pixels.chunks_exact_mut(4) {
            px[0] = color.r;
            px[1] = color.g;
            px[2] = color.b;
            px[3] = color.a;
        }
    }

    /// Fill the rectangle [x0,x1) x [y0,y1), clipped to the buffer.
    /// Fractional edges are rounded to the nearest pixel.
    pub fn fill_rect(&mut self, x0: f32, y0: f32, x1: f32, y1: f32, color: Rgba) {
        let xa = (x0.round().max(0.0) as u32).min(self.width);
        let xb = (x1.round().max(0.0) as u32).min(self.width);
        let ya = (y0.round().max(0.0) as u32).min(self.height);
        let yb = (y1.round().max(0.0) as u32).min(self.height);
        for y in ya..yb {
            let row = (y * self.width * 4) as usize;
            for x in xa..xb {
                let at = row + (x * 4) as usize;
                self.pixels[at] = color.r;
                self.pixels[at + 1] = color.g;
                self.pixels[at + 2] = color.b;
                self.pixels[at + 3] = color.a;
            }
        }
    }

    /// Opaque copy of another buffer of the same dimensions (the grid
    /// composite step). Dimension mismatch clears instead.
    pub fn copy_from(&mut self, other: &Artifact) {
        if self.width != other.width || self.height != other.height {
            debug!(
                "copy_from dimension mismatch {}x{} vs {}x{}",
                self.width, self.height, other.width, other.height
            );
            self.clear(Rgba::BLACK);
            return;
        }
        self.pixels.copy_from_slice(&other.pixels);
    }

    /// Composite `src` at the given offset, clipped. Pixels with zero alpha
    /// are skipped so overlays keep the destination visible.
    pub fn blit(&mut self, src: &Artifact, x_off: i32, y_off: i32) {
        for sy in 0..src.height as i32 {
            let dy = sy + y_off;
            if dy < 0 || dy >= self.height as i32 {
                continue;
            }
            for sx in 0..src.width as i32 {
                let dx = sx + x_off;
                if dx < 0 || dx >= self.width as i32 {
                    continue;
                }
                let s = ((sy as u32 * src.width + sx as u32) * 4) as usize;
                if src.pixels[s + 3] == 0 {
                    continue;
                }
                let d = ((dy as u32 * self.width + dx as u32) * 4) as usize;
                self.pixels[d..d + 4].copy_from_slice(&src.pixels[s..s + 4]);
            }
        }
    }
}

/// Recycles retired bucket artifacts instead of reallocating.
///
/// Retired artifacts are held as `Arc`s: an entry is only recycled once no
/// concurrent reader still holds a handle (`strong_count == 1`), so an
/// in-flight frame never observes a buffer being rewritten. Unreferenced
/// entries of the wrong size (stale after a lane-extent change) are dropped
/// on acquire.
#[derive(Default)]
pub struct ArtifactPool {
    unused: Vec<Arc<Artifact>>,
}

impl ArtifactPool {
    pub fn new() -> Self {
        ArtifactPool { unused: Vec::new() }
    }

    pub fn release(&mut self, artifact: Arc<Artifact>) {
        self.unused.push(artifact);
    }

    pub fn len(&self) -> usize {
        self.unused.len()
    }

    pub fn is_empty(&self) -> bool {
        self.unused.is_empty()
    }

    /// Take an owned buffer of the given size, reusing a retired one when
    /// possible.
    pub fn acquire(&mut self, width: u32, height: u32) -> Artifact {
        let mut i = 0;
        while i < self.unused.len() {
            if Arc::strong_count(&self.unused[i]) > 1 {
                // A reader still holds this one; leave it for later.
                i += 1;
                continue;
            }
            let arc = self.unused.swap_remove(i);
            match Arc::try_unwrap(arc) {
                Ok(mut artifact) => {
                    if artifact.width == width && artifact.height == height {
                        debug!("Reusing pooled artifact (of {})", self.unused.len() + 1);
                        artifact.clear(Rgba::BLACK);
                        return artifact;
                    }
                    // Wrong size: the extent changed since it was retired.
                    drop(artifact);
                }
                Err(arc) => {
                    // A reader cloned it between the count check and the
                    // unwrap; put it back.
                    self.unused.push(arc);
                    i += 1;
                }
            }
        }
        debug!("Allocating new {}x{} artifact", width, height);
        Artifact::new(width, height)
    }
}
