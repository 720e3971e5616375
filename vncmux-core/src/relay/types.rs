//! Pixel, region and framebuffer types shared by both relay sides.
//!
//! Every buffer in the relay uses one fixed pixel layout (see
//! [`Pixel`]); the upstream client asks the server for exactly this
//! layout, so incoming raw rectangles can be stored without conversion.

use std::sync::{Arc, RwLock};

use crate::error::RelayError;

// ── Pixel ────────────────────────────────────────────────────────

/// One 32-bit pixel.
///
/// Stored as a little-endian word with red in bits 0..8, green in
/// 8..16, blue in 16..24 and alpha in 24..32, so the bytes in memory
/// read `R, G, B, A`. RFB ignores the top byte; buffers allocated by
/// the relay keep it at zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Pixel(u32);

impl Pixel {
    /// All channels zero.
    pub const ZERO: Pixel = Pixel(0);

    /// Build an opaque-agnostic pixel from its colour channels.
    pub const fn from_rgb(red: u8, green: u8, blue: u8) -> Self {
        Pixel(red as u32 | (green as u32) << 8 | (blue as u32) << 16)
    }

    /// Decode the 4 wire bytes of the relay pixel format.
    pub const fn from_wire(bytes: [u8; 4]) -> Self {
        Pixel(u32::from_le_bytes(bytes))
    }

    /// Encode into the 4 wire bytes of the relay pixel format.
    pub const fn to_wire(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    pub const fn red(self) -> u8 {
        self.0 as u8
    }

    pub const fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn blue(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn alpha(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The raw packed word.
    pub const fn word(self) -> u32 {
        self.0
    }
}

// ── Region ───────────────────────────────────────────────────────

/// A rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Region {
    pub x: u16,
    pub y: u16,
    pub width: u16,
    pub height: u16,
}

impl Region {
    pub const fn new(x: u16, y: u16, width: u16, height: u16) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole `width × height` surface anchored at the origin.
    pub const fn full(width: u16, height: u16) -> Self {
        Self::new(0, 0, width, height)
    }

    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Pixel count covered by the region.
    pub const fn area(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Exclusive right edge.
    pub const fn right(&self) -> u32 {
        self.x as u32 + self.width as u32
    }

    /// Exclusive bottom edge.
    pub const fn bottom(&self) -> u32 {
        self.y as u32 + self.height as u32
    }

    /// Intersection with another region; `None` when they do not overlap.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = self.right().min(other.right());
        let bottom = self.bottom().min(other.bottom());
        if right <= left as u32 || bottom <= top as u32 {
            return None;
        }
        Some(Region::new(
            left,
            top,
            (right - left as u32) as u16,
            (bottom - top as u32) as u16,
        ))
    }

    /// Clip to a `width × height` surface. May return an empty region.
    pub fn clip_to(&self, width: u16, height: u16) -> Region {
        self.intersect(&Region::full(width, height))
            .unwrap_or_default()
    }

    /// Bounding box of both regions. Empty regions are ignored.
    pub fn union(&self, other: &Region) -> Region {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let left = self.x.min(other.x);
        let top = self.y.min(other.y);
        let right = self.right().max(other.right());
        let bottom = self.bottom().max(other.bottom());
        Region::new(
            left,
            top,
            (right - left as u32).min(u16::MAX as u32) as u16,
            (bottom - top as u32).min(u16::MAX as u32) as u16,
        )
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}+{}+{}", self.width, self.height, self.x, self.y)
    }
}

// ── PixelBuffer ──────────────────────────────────────────────────

/// A row-major raster of [`Pixel`]s without row padding.
///
/// `pixels.len() == width * height` holds for every value a caller
/// can observe: the constructors either produce a complete buffer or
/// fail, and nothing resizes a buffer in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u16,
    height: u16,
    pixels: Vec<Pixel>,
}

/// The downstream framebuffer, written by the relay and read by viewers.
pub type SharedPixels = Arc<RwLock<PixelBuffer>>;

impl PixelBuffer {
    /// A 0×0 buffer that owns no storage.
    pub const fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            pixels: Vec::new(),
        }
    }

    /// Allocate a zero-filled buffer.
    ///
    /// Fails with [`RelayError::OutOfMemory`] instead of aborting when
    /// the allocation cannot be satisfied.
    pub fn allocate(width: u16, height: u16) -> Result<Self, RelayError> {
        let len = usize::from(width) * usize::from(height);
        let mut pixels = Vec::new();
        pixels
            .try_reserve_exact(len)
            .map_err(|_| RelayError::OutOfMemory { width, height })?;
        pixels.resize(len, Pixel::ZERO);
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// Drop the storage and become 0×0. Calling it again is a no-op.
    pub fn release(&mut self) {
        self.pixels = Vec::new();
        self.width = 0;
        self.height = 0;
    }

    pub fn width(&self) -> u16 {
        self.width
    }

    pub fn height(&self) -> u16 {
        self.height
    }

    /// `(width, height)`.
    pub fn dimensions(&self) -> (u16, u16) {
        (self.width, self.height)
    }

    /// Whether the buffer holds no pixels.
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    /// Mutable pixel access. The slice length is fixed, so the
    /// dimension invariant cannot be broken through it.
    pub fn pixels_mut(&mut self) -> &mut [Pixel] {
        &mut self.pixels
    }

    /// Pixel at `(x, y)`, or `None` outside the buffer.
    pub fn get(&self, x: u16, y: u16) -> Option<Pixel> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some(self.pixels[self.index(x, y)])
    }

    /// One row of pixels.
    ///
    /// # Panics
    ///
    /// Panics if `y` is out of bounds.
    pub fn row(&self, y: u16) -> &[Pixel] {
        let start = self.index(0, y);
        &self.pixels[start..start + self.width as usize]
    }

    /// Copy the overlapping top-left area of `src` into `self`.
    ///
    /// The copied extent is `min(widths) × min(heights)`. Pixels of
    /// `self` outside that extent keep whatever they held before, so a
    /// smaller source leaves stale content at the right and bottom.
    /// Returns the copied region.
    pub fn copy_clipped_from(&mut self, src: &PixelBuffer) -> Region {
        let width = self.width.min(src.width);
        let height = self.height.min(src.height);
        let region = Region::full(width, height);
        if region.is_empty() {
            return region;
        }

        let cols = width as usize;
        for y in 0..height {
            let dst_start = self.index(0, y);
            let src_start = src.index(0, y);
            self.pixels[dst_start..dst_start + cols]
                .copy_from_slice(&src.pixels[src_start..src_start + cols]);
        }
        region
    }

    /// Store a rectangle of wire-format pixel bytes.
    ///
    /// `data` holds `region.height` rows of `region.width * 4` bytes.
    /// Parts of the rectangle outside the buffer are dropped. Returns
    /// the number of pixels actually written.
    pub fn write_rect(&mut self, region: Region, data: &[u8]) -> usize {
        let stride = region.width as usize * 4;
        if data.len() < stride * region.height as usize {
            return 0;
        }
        let Some(clip) = region.intersect(&Region::full(self.width, self.height)) else {
            return 0;
        };

        let skip_cols = (clip.x - region.x) as usize;
        let cols = clip.width as usize;
        for y in clip.y..clip.y + clip.height {
            let src_row = (y - region.y) as usize * stride + skip_cols * 4;
            let src = &data[src_row..src_row + cols * 4];
            let dst_start = self.index(clip.x, y);
            for (dst, bytes) in self.pixels[dst_start..dst_start + cols]
                .iter_mut()
                .zip(src.chunks_exact(4))
            {
                *dst = Pixel::from_wire([bytes[0], bytes[1], bytes[2], bytes[3]]);
            }
        }
        clip.area()
    }

    /// Move a `dst.width × dst.height` block from `(src_x, src_y)` to
    /// the position of `dst`, clipped to the buffer. Overlapping
    /// source and destination are handled.
    pub fn copy_rect(&mut self, src_x: u16, src_y: u16, dst: Region) {
        let (bw, bh) = (self.width as usize, self.height as usize);
        let (sx, sy) = (src_x as usize, src_y as usize);
        let (dx, dy) = (dst.x as usize, dst.y as usize);
        if sx >= bw || dx >= bw || sy >= bh || dy >= bh {
            return;
        }
        let cols = (dst.width as usize).min(bw - sx).min(bw - dx);
        let rows = (dst.height as usize).min(bh - sy).min(bh - dy);

        let mut move_row = |r: usize| {
            let from = (sy + r) * bw + sx;
            let to = (dy + r) * bw + dx;
            self.pixels.copy_within(from..from + cols, to);
        };
        if dy > sy {
            (0..rows).rev().for_each(&mut move_row);
        } else {
            (0..rows).for_each(&mut move_row);
        }
    }

    fn index(&self, x: u16, y: u16) -> usize {
        y as usize * self.width as usize + x as usize
    }
}

impl Default for PixelBuffer {
    fn default() -> Self {
        Self::empty()
    }
}

// ── BufferAllocator ──────────────────────────────────────────────

/// Allocation policy for framebuffers announced by the upstream.
///
/// A hostile or misconfigured server can announce up to 65535×65535;
/// the optional ceiling turns such sizes into a declined resize
/// rather than a multi-gigabyte allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferAllocator {
    max_pixels: Option<usize>,
}

impl BufferAllocator {
    /// Only the system allocator limits buffer size.
    pub const fn unbounded() -> Self {
        Self { max_pixels: None }
    }

    /// Refuse buffers with more than `max_pixels` pixels.
    pub const fn with_limit(max_pixels: usize) -> Self {
        Self {
            max_pixels: Some(max_pixels),
        }
    }

    pub fn max_pixels(&self) -> Option<usize> {
        self.max_pixels
    }

    /// Allocate a zero-filled `width × height` buffer.
    pub fn allocate(&self, width: u16, height: u16) -> Result<PixelBuffer, RelayError> {
        let len = usize::from(width) * usize::from(height);
        if self.max_pixels.is_some_and(|max| len > max) {
            return Err(RelayError::OutOfMemory { width, height });
        }
        PixelBuffer::allocate(width, height)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn patterned(width: u16, height: u16) -> PixelBuffer {
        let mut buf = PixelBuffer::allocate(width, height).unwrap();
        for y in 0..height {
            for x in 0..width {
                let i = y as usize * width as usize + x as usize;
                buf.pixels_mut()[i] = Pixel::from_rgb(x as u8, y as u8, 0x80);
            }
        }
        buf
    }

    #[test]
    fn pixel_channels() {
        let p = Pixel::from_rgb(1, 2, 3);
        assert_eq!((p.red(), p.green(), p.blue(), p.alpha()), (1, 2, 3, 0));
        assert_eq!(p.to_wire(), [1, 2, 3, 0]);
        assert_eq!(Pixel::from_wire([1, 2, 3, 0]), p);
    }

    #[test]
    fn allocate_is_zeroed_and_sized() {
        for (w, h) in [(0, 0), (0, 7), (7, 0), (1, 1), (13, 5), (640, 480)] {
            let buf = PixelBuffer::allocate(w, h).unwrap();
            assert_eq!(buf.pixels().len(), w as usize * h as usize);
            assert!(buf.pixels().iter().all(|p| *p == Pixel::ZERO));
            assert_eq!(buf.dimensions(), (w, h));
        }
    }

    #[test]
    fn release_is_idempotent() {
        let mut buf = PixelBuffer::allocate(4, 4).unwrap();
        buf.release();
        assert_eq!(buf.dimensions(), (0, 0));
        assert!(buf.is_empty());
        buf.release();
        assert_eq!(buf, PixelBuffer::empty());
    }

    #[test]
    fn allocator_limit_reports_oom() {
        let alloc = BufferAllocator::with_limit(100);
        assert!(alloc.allocate(10, 10).is_ok());
        let err = alloc.allocate(11, 10).unwrap_err();
        assert!(matches!(
            err,
            RelayError::OutOfMemory {
                width: 11,
                height: 10
            }
        ));
    }

    #[test]
    fn clipped_copy_keeps_stale_rows() {
        let src = patterned(100, 50);
        let mut dst = PixelBuffer::allocate(80, 80).unwrap();
        let stale = Pixel::from_rgb(0xde, 0xad, 0xbe);
        dst.pixels_mut().fill(stale);

        let region = dst.copy_clipped_from(&src);
        assert_eq!(region, Region::full(80, 50));

        for y in 0..50 {
            for x in 0..80 {
                assert_eq!(dst.get(x, y), src.get(x, y));
            }
        }
        for y in 50..80 {
            assert!(dst.row(y).iter().all(|p| *p == stale));
        }
    }

    #[test]
    fn copy_from_zero_sized_source_copies_nothing() {
        let src = PixelBuffer::allocate(0, 30).unwrap();
        let mut dst = patterned(8, 8);
        let before = dst.clone();
        let region = dst.copy_clipped_from(&src);
        assert!(region.is_empty());
        assert_eq!(dst, before);
    }

    #[test]
    fn write_rect_clips_to_buffer() {
        let mut buf = PixelBuffer::allocate(4, 4).unwrap();
        let data: Vec<u8> = (0..3 * 3).flat_map(|i| [i as u8, 0, 0, 0]).collect();
        let written = buf.write_rect(Region::new(2, 2, 3, 3), &data);
        assert_eq!(written, 4);
        assert_eq!(buf.get(2, 2), Some(Pixel::from_rgb(0, 0, 0)));
        assert_eq!(buf.get(3, 2), Some(Pixel::from_rgb(1, 0, 0)));
        assert_eq!(buf.get(2, 3), Some(Pixel::from_rgb(3, 0, 0)));
        assert_eq!(buf.get(3, 3), Some(Pixel::from_rgb(4, 0, 0)));
    }

    #[test]
    fn write_rect_rejects_short_data() {
        let mut buf = PixelBuffer::allocate(4, 4).unwrap();
        assert_eq!(buf.write_rect(Region::full(2, 2), &[0u8; 15]), 0);
    }

    #[test]
    fn copy_rect_handles_overlap() {
        let mut buf = patterned(6, 6);
        let original = buf.clone();
        buf.copy_rect(0, 0, Region::new(1, 1, 4, 4));
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(buf.get(x + 1, y + 1), original.get(x, y));
            }
        }
        assert_eq!(buf.get(0, 0), original.get(0, 0));
    }

    #[test]
    fn region_math() {
        let a = Region::new(10, 10, 20, 20);
        let b = Region::new(25, 0, 10, 15);
        assert_eq!(a.intersect(&b), Some(Region::new(25, 10, 5, 5)));
        assert_eq!(a.union(&b), Region::new(10, 0, 25, 30));
        assert_eq!(a.clip_to(15, 40), Region::new(10, 10, 5, 20));
        assert!(a.clip_to(5, 5).is_empty());
        assert_eq!(Region::default().union(&a), a);
        assert_eq!(a.to_string(), "20x20+10+10");
    }
}
