//! Pixel formats, negotiated video formats and the per-device format catalog.

use std::cmp::Ordering;
use std::fmt;

use tracing::{debug, warn};

use crate::error::Result;

/// Pixel format representation (e.g., YUYV, MJPG, RGB3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");
    /// UYVY pixel format (4:2:2 packed, chroma first).
    pub const UYVY: Self = Self::new(b"UYVY");
    /// MJPEG pixel format (Motion JPEG).
    pub const MJPG: Self = Self::new(b"MJPG");
    /// RGB3 pixel format (24-bit RGB).
    pub const RGB3: Self = Self::new(b"RGB3");
    /// BGR3 pixel format (24-bit BGR).
    pub const BGR3: Self = Self::new(b"BGR3");
    /// BGR4 pixel format (32-bit BGRA).
    pub const BGR4: Self = Self::new(b"BGR4");
    /// RGB4 pixel format (32-bit RGBA).
    pub const RGB4: Self = Self::new(b"RGB4");
    /// 8-bit greyscale.
    pub const GREY: Self = Self::new(b"GREY");
    /// 16-bit greyscale.
    pub const Y16: Self = Self::new(b"Y16 ");
    /// NV12 (4:2:0, interleaved chroma plane).
    pub const NV12: Self = Self::new(b"NV12");
    /// I420 (4:2:0, planar).
    pub const I420: Self = Self::new(b"YU12");

    /// Parse a FourCC from its textual form; shorter codes are space padded.
    #[must_use]
    pub fn parse(code: &str) -> Option<Self> {
        let bytes = code.as_bytes();
        if bytes.is_empty() || bytes.len() > 4 || !code.is_ascii() {
            return None;
        }
        let mut repr = [b' '; 4];
        for (slot, byte) in repr.iter_mut().zip(bytes) {
            *slot = *byte;
        }
        Some(Self(repr))
    }

    /// Nominal storage bits per pixel. Compressed encodings report the
    /// bound used for buffer sizing.
    #[must_use]
    pub const fn bits_per_pixel(self) -> u16 {
        match &self.0 {
            b"GREY" => 8,
            b"NV12" | b"YU12" => 12,
            b"YUYV" | b"UYVY" | b"Y16 " => 16,
            b"BGR4" | b"RGB4" => 32,
            _ => 24,
        }
    }

    /// Whether frames of this encoding have a variable payload size.
    #[must_use]
    pub const fn is_compressed(self) -> bool {
        matches!(&self.0, b"MJPG")
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text: String = self.0.iter().map(|b| char::from(*b)).collect();
        f.write_str(text.trim_end())
    }
}

impl From<v4l::FourCC> for FourCC {
    fn from(fourcc: v4l::FourCC) -> Self {
        Self(fourcc.repr)
    }
}

impl From<FourCC> for v4l::FourCC {
    fn from(fourcc: FourCC) -> Self {
        Self::new(&fourcc.0)
    }
}

/// Opaque reference to the device-native descriptor a [`VideoFormat`] was
/// decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeFormat {
    capability: usize,
    token: u64,
}

impl NativeFormat {
    /// Create a native handle for capability entry `capability`. `token` is
    /// backend specific data needed to re-apply the entry.
    #[must_use]
    pub const fn new(capability: usize, token: u64) -> Self {
        Self { capability, token }
    }

    /// Capability entry index on the device.
    #[must_use]
    pub const fn capability(&self) -> usize {
        self.capability
    }

    /// Backend specific token.
    #[must_use]
    pub const fn token(&self) -> u64 {
        self.token
    }
}

/// Video format specification.
///
/// Equality and ordering ignore the native handle. Formats order by width,
/// then height, then bits per pixel.
#[derive(Debug, Clone)]
pub struct VideoFormat {
    /// Pixel format.
    pub fourcc: FourCC,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Storage bits per pixel.
    pub bits_per_pixel: u16,
    /// Total frame size in bytes.
    pub total_bytes: u32,
    native: Option<NativeFormat>,
}

impl VideoFormat {
    /// Create a new format specification with a size derived from the encoding.
    ///
    /// Sizes whose frame would not fit in `u32` bytes yield the empty sentinel.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(width: u32, height: u32, fourcc: FourCC) -> Self {
        let bits_per_pixel = fourcc.bits_per_pixel();
        let total_bytes = width as u64 * height as u64 * bits_per_pixel as u64 / 8;
        if total_bytes > u32::MAX as u64 {
            return Self::empty();
        }
        let total_bytes = total_bytes as u32;
        Self {
            fourcc,
            width,
            height,
            bits_per_pixel,
            total_bytes,
            native: None,
        }
    }

    /// The "no format" sentinel.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            fourcc: FourCC([0; 4]),
            width: 0,
            height: 0,
            bits_per_pixel: 0,
            total_bytes: 0,
            native: None,
        }
    }

    /// Whether this is the "no format" sentinel.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Override the total frame size (drivers may pad lines).
    #[must_use]
    pub const fn with_total_bytes(mut self, total_bytes: u32) -> Self {
        self.total_bytes = total_bytes;
        self
    }

    /// Attach the device-native descriptor.
    #[must_use]
    pub const fn with_native(mut self, native: NativeFormat) -> Self {
        self.native = Some(native);
        self
    }

    /// Device-native descriptor, absent for formats built by hand.
    #[must_use]
    pub const fn native(&self) -> Option<&NativeFormat> {
        self.native.as_ref()
    }

    /// Bytes per line for packed encodings.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn stride(&self) -> u32 {
        let stride = self.width as u64 * self.bits_per_pixel as u64 / 8;
        if stride > u32::MAX as u64 {
            u32::MAX
        } else {
            stride as u32
        }
    }

    fn key(&self) -> (u32, u32, u16, FourCC, u32) {
        (
            self.width,
            self.height,
            self.bits_per_pixel,
            self.fourcc,
            self.total_bytes,
        )
    }
}

impl Default for VideoFormat {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for VideoFormat {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for VideoFormat {}

impl PartialOrd for VideoFormat {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VideoFormat {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

impl fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<none>");
        }
        write!(
            f,
            "{} {}x{} ({} bpp, {} bytes)",
            self.fourcc, self.width, self.height, self.bits_per_pixel, self.total_bytes
        )
    }
}

/// Source of native capability entries, implemented by capture backends.
pub trait FormatSource {
    /// Number of native capability entries.
    fn capability_count(&self) -> Result<usize>;

    /// Decode capability entry `index`. May return the empty sentinel for
    /// entries that carry no usable video format.
    fn capability(&self, index: usize) -> Result<VideoFormat>;
}

/// Sorted, de-duplicated list of formats a device can produce.
#[derive(Debug, Clone, Default)]
pub struct FormatCatalog {
    formats: Vec<VideoFormat>,
}

impl FormatCatalog {
    /// Create an empty catalog.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            formats: Vec::new(),
        }
    }

    /// Replace the catalog contents with the entries of `source`.
    ///
    /// Empty entries and, when `allowed` is given, encodings outside it are
    /// discarded. Entries that fail to decode are skipped with a warning.
    /// Returns the number of formats kept.
    pub fn import(
        &mut self,
        source: &dyn FormatSource,
        allowed: Option<&[FourCC]>,
    ) -> Result<usize> {
        self.clear();
        let count = source.capability_count()?;

        for index in 0..count {
            let format = match source.capability(index) {
                Ok(format) => format,
                Err(err) => {
                    warn!(index, error = %err, "skipping unreadable capability entry");
                    continue;
                }
            };
            if format.is_empty() {
                continue;
            }
            if let Some(allowed) = allowed {
                if !allowed.contains(&format.fourcc) {
                    continue;
                }
            }
            self.formats.push(format);
        }

        self.formats.sort();
        self.formats.dedup();
        debug!(entries = count, kept = self.formats.len(), "format catalog imported");
        Ok(self.formats.len())
    }

    /// Position of `format` in the catalog.
    #[must_use]
    pub fn index_of(&self, format: &VideoFormat) -> Option<usize> {
        self.formats.iter().position(|f| f == format)
    }

    /// Position of the format decoded from `native`.
    #[must_use]
    pub fn index_of_native(&self, native: &NativeFormat) -> Option<usize> {
        self.formats
            .iter()
            .position(|f| f.native() == Some(native))
    }

    /// Catalog entry matching `format`, carrying its native handle.
    ///
    /// Falls back to the first entry with the same size and encoding, since
    /// drivers may report a frame size other than the nominal one.
    #[must_use]
    pub fn resolve(&self, format: &VideoFormat) -> Option<&VideoFormat> {
        self.index_of(format)
            .and_then(|index| self.formats.get(index))
            .or_else(|| {
                self.formats.iter().find(|entry| {
                    entry.width == format.width
                        && entry.height == format.height
                        && entry.fourcc == format.fourcc
                })
            })
    }

    /// Format at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&VideoFormat> {
        self.formats.get(index)
    }

    /// All formats, ordered.
    #[must_use]
    pub fn as_slice(&self) -> &[VideoFormat] {
        &self.formats
    }

    /// Number of formats.
    #[must_use]
    pub fn len(&self) -> usize {
        self.formats.len()
    }

    /// Whether the catalog holds no formats.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Drop every format and the native handles they own.
    pub fn clear(&mut self) {
        self.formats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;

    struct ListSource(Vec<Result<VideoFormat>>);

    impl FormatSource for ListSource {
        fn capability_count(&self) -> Result<usize> {
            Ok(self.0.len())
        }

        fn capability(&self, index: usize) -> Result<VideoFormat> {
            match self.0.get(index) {
                Some(Ok(format)) => Ok(format.clone()),
                Some(Err(err)) => Err(CaptureError::backend(err)),
                None => Err(CaptureError::backend("no such entry")),
            }
        }
    }

    fn native(index: usize, format: VideoFormat) -> VideoFormat {
        format.with_native(NativeFormat::new(index, 0))
    }

    #[test]
    fn test_format_sizes() {
        let yuyv = VideoFormat::new(640, 480, FourCC::YUYV);
        assert_eq!(yuyv.bits_per_pixel, 16);
        assert_eq!(yuyv.total_bytes, 640 * 480 * 2);
        assert_eq!(yuyv.stride(), 1280);

        let nv12 = VideoFormat::new(640, 480, FourCC::NV12);
        assert_eq!(nv12.total_bytes, 640 * 480 * 3 / 2);
    }

    #[test]
    fn test_resolve_matches_driver_sized_entry() {
        let padded = VideoFormat::new(640, 480, FourCC::YUYV).with_total_bytes(704 * 480 * 2);
        let mut catalog = FormatCatalog::new();
        catalog
            .import(&ListSource(vec![Ok(native(0, padded.clone()))]), None)
            .expect("import failed");

        let requested = VideoFormat::new(640, 480, FourCC::YUYV);
        assert_eq!(catalog.index_of(&requested), None);
        let entry = catalog.resolve(&requested).expect("resolved");
        assert_eq!(entry.total_bytes, padded.total_bytes);
        assert!(entry.native().is_some());
        assert!(catalog
            .resolve(&VideoFormat::new(640, 480, FourCC::MJPG))
            .is_none());
    }

    #[test]
    fn test_large_format_sizes() {
        // The bit count exceeds u32 even though the byte count does not.
        let large = VideoFormat::new(16384, 16384, FourCC::YUYV);
        assert_eq!(large.total_bytes, 16384 * 16384 * 2);
        assert_eq!(large.stride(), 32768);

        let huge = VideoFormat::new(65536, 65536, FourCC::RGB4);
        assert!(huge.is_empty());
        assert_eq!(huge.total_bytes, 0);
    }

    #[test]
    fn test_equality_ignores_native_handle() {
        let a = native(3, VideoFormat::new(320, 240, FourCC::YUYV));
        let b = VideoFormat::new(320, 240, FourCC::YUYV);
        assert_eq!(a, b);
    }

    #[test]
    fn test_ordering_by_width_height_bpp() {
        let mut formats = vec![
            VideoFormat::new(1280, 720, FourCC::YUYV),
            VideoFormat::new(640, 480, FourCC::RGB3),
            VideoFormat::new(640, 360, FourCC::YUYV),
            VideoFormat::new(640, 480, FourCC::YUYV),
        ];
        formats.sort();
        let order: Vec<(u32, u32, u16)> = formats
            .iter()
            .map(|f| (f.width, f.height, f.bits_per_pixel))
            .collect();
        assert_eq!(
            order,
            vec![(640, 360, 16), (640, 480, 16), (640, 480, 24), (1280, 720, 16)]
        );
    }

    #[test]
    fn test_empty_sentinel() {
        assert!(VideoFormat::empty().is_empty());
        assert!(VideoFormat::default().is_empty());
        assert!(!VideoFormat::new(1, 1, FourCC::GREY).is_empty());
        assert_eq!(VideoFormat::empty().to_string(), "<none>");
    }

    #[test]
    fn test_fourcc_parse_and_display() {
        assert_eq!(FourCC::parse("YUYV"), Some(FourCC::YUYV));
        assert_eq!(FourCC::parse("Y16"), Some(FourCC::Y16));
        assert_eq!(FourCC::parse(""), None);
        assert_eq!(FourCC::parse("TOOLONG"), None);
        assert_eq!(FourCC::Y16.to_string(), "Y16");
        assert_eq!(FourCC::MJPG.to_string(), "MJPG");
    }

    #[test]
    fn test_import_discards_empty_and_deduplicates() {
        let source = ListSource(vec![
            Ok(native(0, VideoFormat::new(1280, 720, FourCC::YUYV))),
            Ok(VideoFormat::empty()),
            Ok(native(2, VideoFormat::new(640, 480, FourCC::YUYV))),
            Ok(native(3, VideoFormat::new(1280, 720, FourCC::YUYV))),
            Err(CaptureError::backend("bad media type")),
        ]);
        let mut catalog = FormatCatalog::new();
        let kept = catalog.import(&source, None).expect("import failed");

        assert_eq!(kept, 2);
        assert_eq!(catalog.get(0).map(|f| f.width), Some(640));
        // First occurrence of a duplicate keeps its native handle.
        assert_eq!(
            catalog.get(1).and_then(VideoFormat::native).map(NativeFormat::capability),
            Some(0)
        );
    }

    #[test]
    fn test_import_allow_list() {
        let source = ListSource(vec![
            Ok(VideoFormat::new(640, 480, FourCC::YUYV)),
            Ok(VideoFormat::new(640, 480, FourCC::MJPG)),
            Ok(VideoFormat::new(320, 240, FourCC::RGB3)),
        ]);
        let mut catalog = FormatCatalog::new();
        catalog
            .import(&source, Some(&[FourCC::MJPG, FourCC::RGB3]))
            .expect("import failed");

        assert_eq!(catalog.len(), 2);
        assert!(catalog.iter_fourccs().all(|c| c != FourCC::YUYV));
    }

    #[test]
    fn test_import_replaces_previous_contents() {
        let mut catalog = FormatCatalog::new();
        let first = ListSource(vec![Ok(VideoFormat::new(640, 480, FourCC::YUYV))]);
        let second = ListSource(vec![Ok(VideoFormat::new(320, 240, FourCC::YUYV))]);
        catalog.import(&first, None).expect("import failed");
        catalog.import(&second, None).expect("import failed");
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(0).map(|f| f.width), Some(320));
    }

    #[test]
    fn test_index_of_empty_catalog() {
        let catalog = FormatCatalog::new();
        assert_eq!(catalog.index_of(&VideoFormat::new(640, 480, FourCC::YUYV)), None);
        assert_eq!(catalog.index_of_native(&NativeFormat::new(0, 0)), None);
    }

    #[test]
    fn test_index_of_singleton_catalog() {
        let source = ListSource(vec![Ok(native(7, VideoFormat::new(640, 480, FourCC::YUYV)))]);
        let mut catalog = FormatCatalog::new();
        catalog.import(&source, None).expect("import failed");

        assert_eq!(catalog.index_of(&VideoFormat::new(640, 480, FourCC::YUYV)), Some(0));
        assert_eq!(catalog.index_of(&VideoFormat::new(640, 360, FourCC::YUYV)), None);
        assert_eq!(catalog.index_of_native(&NativeFormat::new(7, 0)), Some(0));
        assert_eq!(catalog.index_of_native(&NativeFormat::new(8, 0)), None);
    }

    #[test]
    fn test_index_of_same_resolution_different_encoding() {
        let source = ListSource(vec![
            Ok(native(0, VideoFormat::new(640, 480, FourCC::YUYV))),
            Ok(native(1, VideoFormat::new(640, 480, FourCC::RGB3))),
        ]);
        let mut catalog = FormatCatalog::new();
        catalog.import(&source, None).expect("import failed");

        let yuyv = catalog.index_of(&VideoFormat::new(640, 480, FourCC::YUYV));
        let rgb = catalog.index_of(&VideoFormat::new(640, 480, FourCC::RGB3));
        assert_eq!(yuyv, Some(0));
        assert_eq!(rgb, Some(1));
        assert_eq!(catalog.index_of(&VideoFormat::new(640, 480, FourCC::GREY)), None);
        assert_eq!(
            catalog
                .resolve(&VideoFormat::new(640, 480, FourCC::RGB3))
                .and_then(VideoFormat::native)
                .map(NativeFormat::capability),
            Some(1)
        );
    }

    #[test]
    fn test_clear() {
        let source = ListSource(vec![Ok(VideoFormat::new(640, 480, FourCC::YUYV))]);
        let mut catalog = FormatCatalog::new();
        catalog.import(&source, None).expect("import failed");
        catalog.clear();
        assert!(catalog.is_empty());
    }

    impl FormatCatalog {
        fn iter_fourccs(&self) -> impl Iterator<Item = FourCC> + '_ {
            self.formats.iter().map(|f| f.fourcc)
        }
    }
}
