//! Pure Rust COG (Cloud Optimized `GeoTIFF`) reader
//!
//! Follows the COG access pattern:
//! - One prefix read (typically < 16KB) covers the IFD chain of a COG
//! - Tile data is fetched with range requests, one block at a time
//! - Overviews are exposed as additional [`ImageLevel`]s
//!
//! Supported: classic TIFF and BigTIFF, tiled and stripped layouts,
//! chunky and planar band layouts, None/LZW/Deflate/ZSTD/JPEG compression,
//! predictors 1/2/3, CRS from the `GeoKey` directory, GDAL nodata.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::debug;

use crate::error::{AnyResult, MosaicError, Result};
use crate::range_reader::RangeReader;

// TIFF tag constants
const TAG_NEW_SUBFILE_TYPE: u16 = 254;
const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PLANAR_CONFIGURATION: u16 = 284;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_JPEG_TABLES: u16 = 347;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_MODEL_TRANSFORMATION: u16 = 34264;
const TAG_GEO_KEY_DIRECTORY: u16 = 34735;
const TAG_GDAL_NODATA: u16 = 42113;

// GeoKey constants
const GEO_KEY_GEOGRAPHIC_TYPE: u16 = 2048;
const GEO_KEY_PROJECTED_CRS: u16 = 3072;
const GEO_KEY_USER_DEFINED: u16 = 32767;

// Compression constants
const COMPRESSION_NONE: u16 = 1;
const COMPRESSION_LZW: u16 = 5;
const COMPRESSION_JPEG: u16 = 7;
const COMPRESSION_DEFLATE: u16 = 8;
const COMPRESSION_ADOBE_DEFLATE: u16 = 32946;
const COMPRESSION_ZSTD: u16 = 50000;

// Sample format constants
const SAMPLE_FORMAT_UINT: u16 = 1;
const SAMPLE_FORMAT_INT: u16 = 2;
const SAMPLE_FORMAT_FLOAT: u16 = 3;

// NewSubfileType bits
const SUBFILE_REDUCED_RESOLUTION: u64 = 1;
const SUBFILE_MASK: u64 = 4;

/// Bytes fetched up front; COG writers put every IFD in this prefix
const HEADER_PREFIX_BYTES: usize = 16 * 1024;
/// Upper bound on IFDs walked, guards against cyclic IFD chains
const MAX_IFDS: usize = 32;
const MAX_IFD_ENTRIES: u64 = 4096;

/// Data type detected from TIFF tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CogDataType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
}

impl CogDataType {
    #[must_use]
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            CogDataType::UInt8 | CogDataType::Int8 => 1,
            CogDataType::UInt16 | CogDataType::Int16 => 2,
            CogDataType::UInt32 | CogDataType::Int32 | CogDataType::Float32 => 4,
            CogDataType::UInt64 | CogDataType::Int64 | CogDataType::Float64 => 8,
        }
    }

    /// Detect data type from TIFF tags
    #[must_use]
    pub fn from_tags(bits_per_sample: u16, sample_format: u16) -> Option<Self> {
        match (sample_format, bits_per_sample) {
            (SAMPLE_FORMAT_INT, 8) => Some(CogDataType::Int8),
            (SAMPLE_FORMAT_INT, 16) => Some(CogDataType::Int16),
            (SAMPLE_FORMAT_INT, 32) => Some(CogDataType::Int32),
            (SAMPLE_FORMAT_INT, 64) => Some(CogDataType::Int64),
            (SAMPLE_FORMAT_FLOAT, 32) => Some(CogDataType::Float32),
            (SAMPLE_FORMAT_FLOAT, 64) => Some(CogDataType::Float64),
            // Unsigned, also the default when SampleFormat is absent
            (_, 8) => Some(CogDataType::UInt8),
            (_, 16) => Some(CogDataType::UInt16),
            (_, 32) => Some(CogDataType::UInt32),
            (SAMPLE_FORMAT_UINT, 64) => Some(CogDataType::UInt64),
            _ => None,
        }
    }
}

/// Compression method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lzw,
    Jpeg,
    Deflate,
    Zstd,
}

impl Compression {
    #[must_use]
    pub fn from_tag(value: u16) -> Option<Self> {
        match value {
            COMPRESSION_NONE => Some(Compression::None),
            COMPRESSION_LZW => Some(Compression::Lzw),
            COMPRESSION_JPEG => Some(Compression::Jpeg),
            COMPRESSION_DEFLATE | COMPRESSION_ADOBE_DEFLATE => Some(Compression::Deflate),
            COMPRESSION_ZSTD => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Affine pixel-to-world transform.
///
/// `x = c + a * col + b * row`, `y = f + d * col + e * row`, with `(col, row)`
/// measured from the top-left corner of the top-left pixel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub a: f64,
    pub b: f64,
    pub c: f64,
    pub d: f64,
    pub e: f64,
    pub f: f64,
}

impl GeoTransform {
    /// From `ModelPixelScale` + `ModelTiepoint`
    fn from_scale_and_tiepoint(scale: &[f64], tie: &[f64]) -> Self {
        Self {
            a: scale[0],
            b: 0.0,
            c: tie[3] - tie[0] * scale[0],
            d: 0.0,
            e: -scale[1],
            f: tie[4] + tie[1] * scale[1],
        }
    }

    /// From the 4x4 row-major `ModelTransformation` matrix
    fn from_matrix(m: &[f64]) -> Self {
        Self { a: m[0], b: m[1], c: m[3], d: m[4], e: m[5], f: m[7] }
    }

    #[must_use]
    pub fn pixel_to_world(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.c + self.a * col + self.b * row,
            self.f + self.d * col + self.e * row,
        )
    }

    /// Inverse mapping; `None` for a degenerate transform
    #[must_use]
    pub fn world_to_pixel(&self, x: f64, y: f64) -> Option<(f64, f64)> {
        let det = self.a * self.e - self.b * self.d;
        if det == 0.0 || !det.is_finite() {
            return None;
        }
        let dx = x - self.c;
        let dy = y - self.f;
        Some((
            (self.e * dx - self.b * dy) / det,
            (self.a * dy - self.d * dx) / det,
        ))
    }

    /// World extent `(minx, miny, maxx, maxy)` of a `width` x `height` image
    #[must_use]
    pub fn extent(&self, width: usize, height: usize) -> (f64, f64, f64, f64) {
        let (w, h) = (width as f64, height as f64);
        let corners = [
            self.pixel_to_world(0.0, 0.0),
            self.pixel_to_world(w, 0.0),
            self.pixel_to_world(0.0, h),
            self.pixel_to_world(w, h),
        ];
        corners.iter().fold(
            (f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY),
            |(minx, miny, maxx, maxy), &(x, y)| (minx.min(x), miny.min(y), maxx.max(x), maxy.max(y)),
        )
    }
}

/// One resolution level: the full image or an overview
#[derive(Debug, Clone)]
pub struct ImageLevel {
    pub width: usize,
    pub height: usize,
    /// Block (tile or strip) dimensions
    pub block_width: usize,
    pub block_height: usize,
    pub blocks_across: usize,
    pub blocks_down: usize,
    pub block_offsets: Vec<u64>,
    pub block_byte_counts: Vec<u64>,
}

impl ImageLevel {
    /// Index of the block holding pixel `(col, row)`
    #[must_use]
    pub fn block_index(&self, col: usize, row: usize) -> Option<usize> {
        if col >= self.width || row >= self.height {
            return None;
        }
        Some((row / self.block_height) * self.blocks_across + col / self.block_width)
    }

    /// Pixel position of a block's top-left corner
    #[must_use]
    pub fn block_origin(&self, index: usize) -> (usize, usize) {
        (
            (index % self.blocks_across) * self.block_width,
            (index / self.blocks_across) * self.block_height,
        )
    }

    fn blocks_per_plane(&self) -> usize {
        self.blocks_across * self.blocks_down
    }
}

/// Everything parsed from the IFD chain
#[derive(Debug, Clone)]
pub struct CogHeader {
    /// `levels[0]` is full resolution, overviews follow from finest to coarsest
    pub levels: Vec<ImageLevel>,
    pub bands: usize,
    pub data_type: CogDataType,
    pub compression: Compression,
    pub predictor: u16,
    pub little_endian: bool,
    /// PlanarConfiguration = 2, one plane per band
    pub planar_separate: bool,
    pub geo_transform: Option<GeoTransform>,
    /// Detected CRS (EPSG code)
    pub crs_code: Option<i32>,
    pub nodata: Option<f64>,
    jpeg_tables: Option<Arc<Vec<u8>>>,
}

impl CogHeader {
    #[must_use]
    pub fn width(&self) -> usize {
        self.levels[0].width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.levels[0].height
    }

    /// Full-resolution pixels per level pixel, per axis
    #[must_use]
    pub fn level_scale(&self, level: usize) -> (f64, f64) {
        let l = &self.levels[level];
        (
            self.width() as f64 / l.width as f64,
            self.height() as f64 / l.height as f64,
        )
    }

    /// Coarsest level that still has at least one pixel per output pixel when
    /// one output pixel spans `source_pixels` full-resolution pixels
    #[must_use]
    pub fn best_level_for(&self, source_pixels: f64) -> usize {
        let mut best = 0;
        for level in 1..self.levels.len() {
            let (sx, sy) = self.level_scale(level);
            if sx.max(sy) <= source_pixels {
                best = level;
            }
        }
        best
    }

    /// Value used for pixels with no data
    #[must_use]
    pub fn fill_value(&self) -> f32 {
        self.nodata.map_or(f32::NAN, |v| v as f32)
    }
}

/// COG reader: parsed header plus the source it reads blocks from
pub struct CogReader {
    reader: Arc<dyn RangeReader>,
    header: CogHeader,
}

impl CogReader {
    /// Parse the header of the COG behind `reader`
    pub async fn open(reader: Arc<dyn RangeReader>) -> Result<Self> {
        let header = read_header(reader.as_ref())
            .await
            .map_err(|e| MosaicError::from_any(reader.identifier(), e))?;
        debug!(
            source = reader.identifier(),
            width = header.width(),
            height = header.height(),
            bands = header.bands,
            overviews = header.levels.len() - 1,
            crs = ?header.crs_code,
            "Opened COG"
        );
        Ok(Self { reader, header })
    }

    #[must_use]
    pub fn header(&self) -> &CogHeader {
        &self.header
    }

    #[must_use]
    pub fn identifier(&self) -> &str {
        self.reader.identifier()
    }

    /// Read and decode one block of `level`.
    ///
    /// The result is pixel-interleaved (`(row * block_width + col) * bands + band`)
    /// and always holds a full block, edge blocks included.
    pub async fn read_block(&self, level: usize, index: usize) -> Result<Vec<f32>> {
        self.read_block_any(level, index)
            .await
            .map_err(|e| MosaicError::from_any(self.identifier(), e))
    }

    async fn read_block_any(&self, level: usize, index: usize) -> AnyResult<Vec<f32>> {
        let lvl = self
            .header
            .levels
            .get(level)
            .ok_or_else(|| format!("Level {level} out of range"))?;
        if index >= lvl.blocks_per_plane() {
            return Err(format!("Block index {index} out of range (max {})", lvl.blocks_per_plane()).into());
        }

        if !self.header.planar_separate {
            return self.decode_stored_block(lvl, index, self.header.bands).await;
        }

        // One stored block per band, interleave them
        let planes = try_join_all(
            (0..self.header.bands)
                .map(|band| self.decode_stored_block(lvl, band * lvl.blocks_per_plane() + index, 1)),
        )
        .await?;
        let pixels = lvl.block_width * lvl.block_height;
        let mut interleaved = Vec::with_capacity(pixels * planes.len());
        for pixel in 0..pixels {
            interleaved.extend(planes.iter().map(|plane| plane[pixel]));
        }
        Ok(interleaved)
    }

    async fn decode_stored_block(
        &self,
        level: &ImageLevel,
        stored_index: usize,
        samples: usize,
    ) -> AnyResult<Vec<f32>> {
        let offset = *level
            .block_offsets
            .get(stored_index)
            .ok_or_else(|| format!("Missing offset for block {stored_index}"))?;
        let byte_count = *level
            .block_byte_counts
            .get(stored_index)
            .ok_or_else(|| format!("Missing byte count for block {stored_index}"))?;

        let pixel_count = level.block_width * level.block_height * samples;
        if byte_count == 0 {
            // Sparse COG: block was never written
            return Ok(vec![self.header.fill_value(); pixel_count]);
        }

        let length = usize::try_from(byte_count)?;
        let compressed = self.reader.read_range(offset, length).await?;
        if compressed.len() < length {
            return Err(format!("Block {stored_index} truncated: {} of {length} bytes", compressed.len()).into());
        }

        let decoder = BlockDecoder {
            compression: self.header.compression,
            predictor: self.header.predictor,
            data_type: self.header.data_type,
            little_endian: self.header.little_endian,
            width: level.block_width,
            height: level.block_height,
            samples,
            jpeg_tables: self.header.jpeg_tables.clone(),
        };
        // Decompression is CPU bound
        tokio::task::spawn_blocking(move || decoder.decode(&compressed)).await?
    }
}

// ============================================================================
// Byte order and header access
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Layout {
    little_endian: bool,
    big_tiff: bool,
}

fn array<const N: usize>(bytes: &[u8], pos: usize) -> AnyResult<[u8; N]> {
    bytes
        .get(pos..pos + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or_else(|| "Truncated TIFF structure".into())
}

impl Layout {
    fn u16(self, bytes: &[u8], pos: usize) -> AnyResult<u16> {
        let b = array::<2>(bytes, pos)?;
        Ok(if self.little_endian { u16::from_le_bytes(b) } else { u16::from_be_bytes(b) })
    }

    fn u32(self, bytes: &[u8], pos: usize) -> AnyResult<u32> {
        let b = array::<4>(bytes, pos)?;
        Ok(if self.little_endian { u32::from_le_bytes(b) } else { u32::from_be_bytes(b) })
    }

    fn u64(self, bytes: &[u8], pos: usize) -> AnyResult<u64> {
        let b = array::<8>(bytes, pos)?;
        Ok(if self.little_endian { u64::from_le_bytes(b) } else { u64::from_be_bytes(b) })
    }

    fn f64(self, bytes: &[u8], pos: usize) -> AnyResult<f64> {
        Ok(f64::from_bits(self.u64(bytes, pos)?))
    }

    /// Size of an offset / inline value field
    fn offset_size(self) -> usize {
        if self.big_tiff { 8 } else { 4 }
    }

    fn offset(self, bytes: &[u8], pos: usize) -> AnyResult<u64> {
        if self.big_tiff { self.u64(bytes, pos) } else { self.u32(bytes, pos).map(u64::from) }
    }

    fn entry_count_size(self) -> usize {
        if self.big_tiff { 8 } else { 2 }
    }

    fn entry_size(self) -> usize {
        if self.big_tiff { 20 } else { 12 }
    }
}

/// Serves header reads from the prefix when possible
struct HeaderBytes<'a> {
    reader: &'a dyn RangeReader,
    prefix: Vec<u8>,
}

impl HeaderBytes<'_> {
    async fn read(&self, offset: u64, length: usize) -> AnyResult<Vec<u8>> {
        let start = usize::try_from(offset)?;
        if let Some(slice) = self.prefix.get(start..start.saturating_add(length)) {
            return Ok(slice.to_vec());
        }
        let bytes = self.reader.read_range(offset, length).await?;
        if bytes.len() < length {
            return Err(format!("Truncated read at offset {offset}: {} of {length} bytes", bytes.len()).into());
        }
        Ok(bytes)
    }
}

struct IfdEntry {
    field_type: u16,
    count: u64,
    /// Inline value bytes (4 for classic TIFF, 8 for BigTIFF)
    value: [u8; 8],
}

fn type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1),
        3 | 8 => Some(2),
        4 | 9 | 11 => Some(4),
        5 | 10 | 12 | 16 | 17 | 18 => Some(8),
        _ => None,
    }
}

struct Ifd {
    entries: HashMap<u16, IfdEntry>,
    layout: Layout,
}

impl Ifd {
    async fn read(src: &HeaderBytes<'_>, offset: u64, layout: Layout) -> AnyResult<(Self, u64)> {
        let count_bytes = src.read(offset, layout.entry_count_size()).await?;
        let count = if layout.big_tiff {
            layout.u64(&count_bytes, 0)?
        } else {
            u64::from(layout.u16(&count_bytes, 0)?)
        };
        if count == 0 || count > MAX_IFD_ENTRIES {
            return Err(format!("Implausible IFD entry count {count} at offset {offset}").into());
        }

        let entry_size = layout.entry_size();
        let table_len = count as usize * entry_size + layout.offset_size();
        let table = src
            .read(offset + layout.entry_count_size() as u64, table_len)
            .await?;

        let mut entries = HashMap::with_capacity(count as usize);
        for i in 0..count as usize {
            let pos = i * entry_size;
            let tag = layout.u16(&table, pos)?;
            let field_type = layout.u16(&table, pos + 2)?;
            let (count, value_pos) = if layout.big_tiff {
                (layout.u64(&table, pos + 4)?, pos + 12)
            } else {
                (u64::from(layout.u32(&table, pos + 4)?), pos + 8)
            };
            let mut value = [0_u8; 8];
            let inline = &table[value_pos..value_pos + layout.offset_size()];
            value[..inline.len()].copy_from_slice(inline);
            entries.insert(tag, IfdEntry { field_type, count, value });
        }

        let next = layout.offset(&table, count as usize * entry_size)?;
        Ok((Self { entries, layout }, next))
    }

    fn contains(&self, tag: u16) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Raw value bytes of a tag, following the offset for out-of-line values
    async fn bytes(&self, src: &HeaderBytes<'_>, tag: u16) -> AnyResult<Option<(u16, Vec<u8>)>> {
        let Some(entry) = self.entries.get(&tag) else {
            return Ok(None);
        };
        let size = type_size(entry.field_type)
            .ok_or_else(|| format!("Unsupported field type {} for tag {tag}", entry.field_type))?;
        let total = usize::try_from(entry.count)?
            .checked_mul(size)
            .ok_or_else(|| format!("Tag {tag} too large"))?;
        let data = if total <= self.layout.offset_size() {
            entry.value[..total].to_vec()
        } else {
            let offset = self.layout.offset(&entry.value, 0)?;
            src.read(offset, total).await?
        };
        Ok(Some((entry.field_type, data)))
    }

    async fn uints(&self, src: &HeaderBytes<'_>, tag: u16) -> AnyResult<Option<Vec<u64>>> {
        let Some((field_type, data)) = self.bytes(src, tag).await? else {
            return Ok(None);
        };
        let layout = self.layout;
        let values = match field_type {
            1 => data.iter().map(|&b| u64::from(b)).collect(),
            3 => (0..data.len() / 2)
                .map(|i| layout.u16(&data, i * 2).map(u64::from))
                .collect::<AnyResult<Vec<_>>>()?,
            4 => (0..data.len() / 4)
                .map(|i| layout.u32(&data, i * 4).map(u64::from))
                .collect::<AnyResult<Vec<_>>>()?,
            16 => (0..data.len() / 8)
                .map(|i| layout.u64(&data, i * 8))
                .collect::<AnyResult<Vec<_>>>()?,
            other => return Err(format!("Tag {tag} has non-integer type {other}").into()),
        };
        Ok(Some(values))
    }

    async fn uint(&self, src: &HeaderBytes<'_>, tag: u16) -> AnyResult<Option<u64>> {
        Ok(self.uints(src, tag).await?.and_then(|v| v.first().copied()))
    }

    async fn f64s(&self, src: &HeaderBytes<'_>, tag: u16) -> AnyResult<Option<Vec<f64>>> {
        match self.bytes(src, tag).await? {
            Some((12, data)) => Ok(Some(
                (0..data.len() / 8)
                    .map(|i| self.layout.f64(&data, i * 8))
                    .collect::<AnyResult<Vec<_>>>()?,
            )),
            _ => Ok(None),
        }
    }

    async fn ascii(&self, src: &HeaderBytes<'_>, tag: u16) -> AnyResult<Option<String>> {
        Ok(self.bytes(src, tag).await?.map(|(_, data)| {
            String::from_utf8_lossy(&data)
                .trim_end_matches('\0')
                .trim()
                .to_string()
        }))
    }
}

// ============================================================================
// Header parsing
// ============================================================================

async fn read_header(reader: &dyn RangeReader) -> AnyResult<CogHeader> {
    let prefix = reader.read_range(0, HEADER_PREFIX_BYTES).await?;
    let little_endian = match prefix.get(0..2) {
        Some(b"II") => true,
        Some(b"MM") => false,
        _ => return Err("Invalid TIFF signature".into()),
    };
    let probe = Layout { little_endian, big_tiff: false };
    let version = probe.u16(&prefix, 2)?;
    let (layout, first_ifd) = match version {
        42 => (probe, u64::from(probe.u32(&prefix, 4)?)),
        43 => {
            let layout = Layout { little_endian, big_tiff: true };
            (layout, layout.u64(&prefix, 8)?)
        }
        other => return Err(format!("Invalid TIFF version: {other}").into()),
    };

    let src = HeaderBytes { reader, prefix };
    let (ifd, mut next) = Ifd::read(&src, first_ifd, layout).await?;

    let bands = ifd.uint(&src, TAG_SAMPLES_PER_PIXEL).await?.unwrap_or(1) as usize;
    let bits = ifd.uint(&src, TAG_BITS_PER_SAMPLE).await?.unwrap_or(8) as u16;
    let sample_format = ifd.uint(&src, TAG_SAMPLE_FORMAT).await?.unwrap_or(1) as u16;
    let compression_tag = ifd.uint(&src, TAG_COMPRESSION).await?.unwrap_or(1) as u16;
    let predictor = ifd.uint(&src, TAG_PREDICTOR).await?.unwrap_or(1) as u16;
    let planar_separate = ifd.uint(&src, TAG_PLANAR_CONFIGURATION).await?.unwrap_or(1) == 2;

    let data_type = CogDataType::from_tags(bits, sample_format)
        .ok_or_else(|| format!("Unsupported data type: bits={bits}, format={sample_format}"))?;
    let compression = Compression::from_tag(compression_tag)
        .ok_or_else(|| format!("Unsupported compression: {compression_tag}"))?;
    if !(1..=3).contains(&predictor) {
        return Err(format!("Unsupported predictor: {predictor}").into());
    }
    if bands == 0 {
        return Err("SamplesPerPixel is zero".into());
    }
    let planes = if planar_separate { bands } else { 1 };

    let geo_transform = read_geo_transform(&ifd, &src).await?;
    let crs_code = read_crs_from_geokeys(&ifd, &src).await?;
    let nodata = ifd
        .ascii(&src, TAG_GDAL_NODATA)
        .await?
        .and_then(|s| s.parse::<f64>().ok());
    let jpeg_tables = match ifd.bytes(&src, TAG_JPEG_TABLES).await? {
        Some((_, tables)) if tables.len() > 4 => Some(Arc::new(tables)),
        _ => None,
    };

    let mut levels = vec![read_level(&ifd, &src, planes).await?];

    // Overviews follow in the IFD chain; masks are skipped
    let mut visited = 1;
    while next != 0 && visited < MAX_IFDS {
        visited += 1;
        let (ovr, following) = match Ifd::read(&src, next, layout).await {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(source = reader.identifier(), error = %e, "Stopping at unreadable IFD");
                break;
            }
        };
        next = following;

        let subfile = ovr.uint(&src, TAG_NEW_SUBFILE_TYPE).await?.unwrap_or(0);
        if subfile & SUBFILE_MASK != 0 || subfile & SUBFILE_REDUCED_RESOLUTION == 0 {
            continue;
        }
        match read_level(&ovr, &src, planes).await {
            Ok(level) if level.width > 0 && level.width < levels[0].width => levels.push(level),
            Ok(_) => {}
            Err(e) => {
                debug!(source = reader.identifier(), error = %e, "Skipping unreadable overview");
            }
        }
    }
    levels[1..].sort_by(|a, b| b.width.cmp(&a.width));

    Ok(CogHeader {
        levels,
        bands,
        data_type,
        compression,
        predictor,
        little_endian,
        planar_separate,
        geo_transform,
        crs_code,
        nodata,
        jpeg_tables,
    })
}

async fn read_level(ifd: &Ifd, src: &HeaderBytes<'_>, planes: usize) -> AnyResult<ImageLevel> {
    let width = ifd
        .uint(src, TAG_IMAGE_WIDTH)
        .await?
        .ok_or("Missing ImageWidth tag")? as usize;
    let height = ifd
        .uint(src, TAG_IMAGE_LENGTH)
        .await?
        .ok_or("Missing ImageLength tag")? as usize;
    if width == 0 || height == 0 {
        return Err("Empty image".into());
    }

    let (block_width, block_height, offsets_tag, counts_tag) = if ifd.contains(TAG_TILE_OFFSETS) {
        let tw = ifd.uint(src, TAG_TILE_WIDTH).await?.ok_or("Missing TileWidth tag")? as usize;
        let th = ifd.uint(src, TAG_TILE_LENGTH).await?.ok_or("Missing TileLength tag")? as usize;
        (tw, th, TAG_TILE_OFFSETS, TAG_TILE_BYTE_COUNTS)
    } else if ifd.contains(TAG_STRIP_OFFSETS) {
        // Strips are blocks spanning the full width
        let rows = ifd
            .uint(src, TAG_ROWS_PER_STRIP)
            .await?
            .map_or(height, |r| (r as usize).min(height));
        (width, rows, TAG_STRIP_OFFSETS, TAG_STRIP_BYTE_COUNTS)
    } else {
        return Err("TIFF has neither tile nor strip tags".into());
    };
    if block_width == 0 || block_height == 0 {
        return Err("Zero block dimensions".into());
    }

    let blocks_across = width.div_ceil(block_width);
    let blocks_down = height.div_ceil(block_height);
    let expected = blocks_across * blocks_down * planes;

    let block_offsets = ifd
        .uints(src, offsets_tag)
        .await?
        .ok_or_else(|| format!("Missing tag {offsets_tag}"))?;
    let block_byte_counts = ifd
        .uints(src, counts_tag)
        .await?
        .ok_or_else(|| format!("Missing tag {counts_tag}"))?;
    if block_offsets.len() < expected || block_byte_counts.len() < expected {
        return Err(format!(
            "Expected {expected} blocks, found {} offsets and {} byte counts",
            block_offsets.len(),
            block_byte_counts.len()
        )
        .into());
    }

    Ok(ImageLevel {
        width,
        height,
        block_width,
        block_height,
        blocks_across,
        blocks_down,
        block_offsets,
        block_byte_counts,
    })
}

async fn read_geo_transform(ifd: &Ifd, src: &HeaderBytes<'_>) -> AnyResult<Option<GeoTransform>> {
    if let Some(matrix) = ifd.f64s(src, TAG_MODEL_TRANSFORMATION).await? {
        if matrix.len() >= 16 {
            return Ok(Some(GeoTransform::from_matrix(&matrix)));
        }
    }
    let scale = ifd.f64s(src, TAG_MODEL_PIXEL_SCALE).await?;
    let tie = ifd.f64s(src, TAG_MODEL_TIEPOINT).await?;
    Ok(match (scale, tie) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => {
            Some(GeoTransform::from_scale_and_tiepoint(&scale, &tie))
        }
        _ => None,
    })
}

async fn read_crs_from_geokeys(ifd: &Ifd, src: &HeaderBytes<'_>) -> AnyResult<Option<i32>> {
    let Some(keys) = ifd.uints(src, TAG_GEO_KEY_DIRECTORY).await? else {
        return Ok(None);
    };
    // Header: KeyDirectoryVersion, KeyRevision, MinorRevision, NumberOfKeys,
    // then (KeyID, TIFFTagLocation, Count, Value) per key
    let Some(&num_keys) = keys.get(3) else {
        return Ok(None);
    };

    let mut geographic = None;
    for key in keys[4..].chunks_exact(4).take(num_keys as usize) {
        let (id, location, value) = (key[0] as u16, key[1], key[3] as u16);
        if location != 0 || value == 0 || value == GEO_KEY_USER_DEFINED {
            continue;
        }
        match id {
            GEO_KEY_PROJECTED_CRS => return Ok(Some(i32::from(value))),
            GEO_KEY_GEOGRAPHIC_TYPE => geographic = Some(i32::from(value)),
            _ => {}
        }
    }
    Ok(geographic)
}

// ============================================================================
// Decompression and data conversion
// ============================================================================

struct BlockDecoder {
    compression: Compression,
    predictor: u16,
    data_type: CogDataType,
    little_endian: bool,
    width: usize,
    height: usize,
    samples: usize,
    jpeg_tables: Option<Arc<Vec<u8>>>,
}

impl BlockDecoder {
    fn decode(&self, compressed: &[u8]) -> AnyResult<Vec<f32>> {
        let bytes_per_sample = self.data_type.bytes_per_sample();
        let expected = self.width * self.height * self.samples * bytes_per_sample;

        let mut raw = decompress(compressed, self.compression, expected, self.jpeg_tables.as_deref())?;
        // Short strips at the image bottom and lazy encoders
        raw.resize(expected, 0);

        let row_bytes = self.width * self.samples * bytes_per_sample;
        let little_endian = match self.predictor {
            2 => {
                undo_horizontal_differencing(&mut raw, row_bytes, self.samples, bytes_per_sample, self.little_endian)?;
                self.little_endian
            }
            3 => {
                raw = undo_floating_point_predictor(&raw, row_bytes, self.samples, bytes_per_sample);
                true
            }
            _ => self.little_endian,
        };

        Ok(convert_to_f32(&raw, self.data_type, little_endian))
    }
}

fn decompress(
    compressed: &[u8],
    compression: Compression,
    expected: usize,
    jpeg_tables: Option<&Vec<u8>>,
) -> AnyResult<Vec<u8>> {
    match compression {
        Compression::None => Ok(compressed.to_vec()),
        Compression::Deflate => {
            let mut decoder = flate2::read::ZlibDecoder::new(compressed);
            let mut out = Vec::with_capacity(expected);
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        Compression::Lzw => {
            let mut decoder = weezl::decode::Decoder::with_tiff_size_switch(weezl::BitOrder::Msb, 8);
            Ok(decoder.decode(compressed)?)
        }
        Compression::Zstd => Ok(zstd::stream::decode_all(compressed)?),
        Compression::Jpeg => {
            let stream = match jpeg_tables {
                Some(tables) => merge_jpeg_tables(tables, compressed),
                None => compressed.to_vec(),
            };
            let img = image::load_from_memory_with_format(&stream, image::ImageFormat::Jpeg)
                .map_err(|e| format!("JPEG decode error: {e}"))?;
            Ok(match img {
                image::DynamicImage::ImageLuma8(gray) => gray.into_raw(),
                image::DynamicImage::ImageRgb8(rgb) => rgb.into_raw(),
                other => other.to_rgb8().into_raw(),
            })
        }
    }
}

/// Splice the shared `JPEGTables` (minus EOI) in front of a block's
/// abbreviated stream (minus SOI)
fn merge_jpeg_tables(tables: &[u8], block: &[u8]) -> Vec<u8> {
    if tables.len() < 4 || block.len() < 2 {
        return block.to_vec();
    }
    let mut merged = Vec::with_capacity(tables.len() + block.len());
    merged.extend_from_slice(&tables[..tables.len() - 2]);
    merged.extend_from_slice(&block[2..]);
    merged
}

trait PredictorSample: Copy {
    const SIZE: usize;
    fn read(bytes: &[u8], little_endian: bool) -> Self;
    fn write(self, bytes: &mut [u8], little_endian: bool);
    fn add(self, other: Self) -> Self;
}

macro_rules! predictor_sample {
    ($($t:ty),*) => {$(
        impl PredictorSample for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            fn read(bytes: &[u8], little_endian: bool) -> Self {
                let mut buf = [0_u8; std::mem::size_of::<$t>()];
                buf.copy_from_slice(&bytes[..Self::SIZE]);
                if little_endian { <$t>::from_le_bytes(buf) } else { <$t>::from_be_bytes(buf) }
            }

            fn write(self, bytes: &mut [u8], little_endian: bool) {
                let buf = if little_endian { self.to_le_bytes() } else { self.to_be_bytes() };
                bytes[..Self::SIZE].copy_from_slice(&buf);
            }

            fn add(self, other: Self) -> Self {
                self.wrapping_add(other)
            }
        }
    )*};
}

predictor_sample!(u8, u16, u32, u64);

fn accumulate_row<T: PredictorSample>(row: &mut [u8], stride: usize, little_endian: bool) {
    let count = row.len() / T::SIZE;
    for i in stride..count {
        let prev = T::read(&row[(i - stride) * T::SIZE..], little_endian);
        let curr = T::read(&row[i * T::SIZE..], little_endian);
        curr.add(prev).write(&mut row[i * T::SIZE..], little_endian);
    }
}

/// Predictor 2: every sample holds the difference to the same band of the
/// previous pixel. Rows are independent, samples are added as whole integers.
fn undo_horizontal_differencing(
    data: &mut [u8],
    row_bytes: usize,
    samples: usize,
    bytes_per_sample: usize,
    little_endian: bool,
) -> AnyResult<()> {
    for row in data.chunks_mut(row_bytes) {
        match bytes_per_sample {
            1 => accumulate_row::<u8>(row, samples, little_endian),
            2 => accumulate_row::<u16>(row, samples, little_endian),
            4 => accumulate_row::<u32>(row, samples, little_endian),
            8 => accumulate_row::<u64>(row, samples, little_endian),
            other => return Err(format!("Predictor 2 with {other}-byte samples").into()),
        }
    }
    Ok(())
}

/// Predictor 3: bytes are differenced with a stride of one pixel, after the
/// samples of a row were split into byte planes, most significant first.
/// Returns the row data in little-endian sample order.
fn undo_floating_point_predictor(
    data: &[u8],
    row_bytes: usize,
    samples: usize,
    bytes_per_sample: usize,
) -> Vec<u8> {
    let mut out = vec![0_u8; data.len()];
    for (row_in, row_out) in data.chunks(row_bytes).zip(out.chunks_mut(row_bytes)) {
        let mut row = row_in.to_vec();
        for i in samples..row.len() {
            row[i] = row[i].wrapping_add(row[i - samples]);
        }
        let values = row.len() / bytes_per_sample;
        for v in 0..values {
            for byte in 0..bytes_per_sample {
                row_out[v * bytes_per_sample + byte] = row[(bytes_per_sample - byte - 1) * values + v];
            }
        }
    }
    out
}

fn convert_to_f32(data: &[u8], data_type: CogDataType, little_endian: bool) -> Vec<f32> {
    macro_rules! samples_as_f32 {
        ($t:ty) => {{
            const N: usize = std::mem::size_of::<$t>();
            data.chunks_exact(N)
                .map(|chunk| {
                    let mut buf = [0_u8; N];
                    buf.copy_from_slice(chunk);
                    let value = if little_endian { <$t>::from_le_bytes(buf) } else { <$t>::from_be_bytes(buf) };
                    value as f32
                })
                .collect()
        }};
    }

    match data_type {
        CogDataType::UInt8 => data.iter().map(|&v| f32::from(v)).collect(),
        CogDataType::Int8 => data.iter().map(|&v| f32::from(v as i8)).collect(),
        CogDataType::UInt16 => samples_as_f32!(u16),
        CogDataType::Int16 => samples_as_f32!(i16),
        CogDataType::UInt32 => samples_as_f32!(u32),
        CogDataType::Int32 => samples_as_f32!(i32),
        CogDataType::UInt64 => samples_as_f32!(u64),
        CogDataType::Int64 => samples_as_f32!(i64),
        CogDataType::Float32 => samples_as_f32!(f32),
        CogDataType::Float64 => samples_as_f32!(f64),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::TestCog;
    use super::*;
    use crate::range_reader::MemoryRangeReader;

    async fn open(cog: &TestCog) -> CogReader {
        let reader: Arc<dyn RangeReader> = Arc::new(MemoryRangeReader::new("mem://test.tif", cog.build()));
        CogReader::open(reader).await.unwrap()
    }

    #[test]
    fn test_data_type_detection() {
        assert_eq!(CogDataType::from_tags(8, 1), Some(CogDataType::UInt8));
        assert_eq!(CogDataType::from_tags(16, 2), Some(CogDataType::Int16));
        assert_eq!(CogDataType::from_tags(32, 3), Some(CogDataType::Float32));
        assert_eq!(CogDataType::from_tags(16, 0), Some(CogDataType::UInt16));
        assert_eq!(CogDataType::from_tags(12, 1), None);
    }

    #[test]
    fn test_compression_detection() {
        assert_eq!(Compression::from_tag(1), Some(Compression::None));
        assert_eq!(Compression::from_tag(8), Some(Compression::Deflate));
        assert_eq!(Compression::from_tag(32946), Some(Compression::Deflate));
        assert_eq!(Compression::from_tag(50000), Some(Compression::Zstd));
        assert_eq!(Compression::from_tag(34887), None);
    }

    #[test]
    fn test_geo_transform_roundtrip() {
        let gt = GeoTransform::from_scale_and_tiepoint(&[10.0, 10.0, 0.0], &[0.0, 0.0, 0.0, 500_000.0, 4_400_000.0, 0.0]);
        assert_eq!(gt.pixel_to_world(0.0, 0.0), (500_000.0, 4_400_000.0));
        assert_eq!(gt.pixel_to_world(1.0, 1.0), (500_010.0, 4_399_990.0));
        let (col, row) = gt.world_to_pixel(500_105.0, 4_399_895.0).unwrap();
        assert!((col - 10.5).abs() < 1e-9 && (row - 10.5).abs() < 1e-9);

        let (minx, miny, maxx, maxy) = gt.extent(100, 50);
        assert_eq!((minx, miny, maxx, maxy), (500_000.0, 4_399_500.0, 501_000.0, 4_400_000.0));
    }

    /// 16-bit samples must accumulate as whole integers: bytewise addition
    /// would lose the carry between low and high byte.
    #[test]
    fn test_predictor2_16bit_samples() {
        let mut data: Vec<u8> = vec![0x00, 0x01, 0x01, 0x00, 0x01, 0x00, 0x01, 0x00];
        undo_horizontal_differencing(&mut data, 8, 1, 2, true).unwrap();
        let values: Vec<u16> = data.chunks(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        assert_eq!(values, [256, 257, 258, 259]);
    }

    #[test]
    fn test_predictor2_wraps() {
        let mut data: Vec<u8> = vec![0xFF, 0xFF, 0x02, 0x00];
        undo_horizontal_differencing(&mut data, 4, 1, 2, true).unwrap();
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 1);
    }

    #[test]
    fn test_predictor2_multiband_uses_pixel_stride() {
        // 2 pixels x 2 bands, 8-bit: [p0b0, p0b1, p1b0, p1b1]
        let mut data: Vec<u8> = vec![10, 20, 1, 2];
        undo_horizontal_differencing(&mut data, 4, 2, 1, true).unwrap();
        assert_eq!(data, [10, 20, 11, 22]);

        // 16-bit big-endian, same layout
        let mut data: Vec<u8> = vec![0, 100, 0, 200, 0, 1, 0, 2];
        undo_horizontal_differencing(&mut data, 8, 2, 2, false).unwrap();
        let values: Vec<u16> = data.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        assert_eq!(values, [100, 200, 101, 202]);
    }

    #[test]
    fn test_predictor2_rows_are_independent() {
        let mut data: Vec<u8> = vec![5, 1, 7, 1];
        undo_horizontal_differencing(&mut data, 2, 1, 1, true).unwrap();
        assert_eq!(data, [5, 6, 7, 8]);
    }

    #[test]
    fn test_floating_point_predictor() {
        let values = [1.5_f32, 2.25, -3.0];
        // Encode: split into byte planes (most significant first), then difference
        let n = values.len();
        let mut planes = vec![0_u8; n * 4];
        for (v, value) in values.iter().enumerate() {
            let be = value.to_be_bytes();
            for byte in 0..4 {
                planes[byte * n + v] = be[byte];
            }
        }
        let mut encoded = planes.clone();
        for i in (1..encoded.len()).rev() {
            encoded[i] = planes[i].wrapping_sub(planes[i - 1]);
        }

        let decoded = undo_floating_point_predictor(&encoded, encoded.len(), 1, 4);
        assert_eq!(convert_to_f32(&decoded, CogDataType::Float32, true), values);
    }

    #[test]
    fn test_convert_big_endian() {
        let data = [0x01, 0x02, 0xFF, 0xFE];
        assert_eq!(convert_to_f32(&data, CogDataType::UInt16, false), [258.0, 65534.0]);
        assert_eq!(convert_to_f32(&data, CogDataType::Int16, false), [258.0, -2.0]);
    }

    #[test]
    fn test_merge_jpeg_tables() {
        let tables = [0xFF, 0xD8, 0xAA, 0xFF, 0xD9];
        let block = [0xFF, 0xD8, 0xBB, 0xFF, 0xD9];
        assert_eq!(merge_jpeg_tables(&tables, &block), [0xFF, 0xD8, 0xAA, 0xBB, 0xFF, 0xD9]);
    }

    #[tokio::test]
    async fn test_open_parses_header() {
        let mut cog = TestCog::from_fn(40, 24, 3, |x, y, b| (x + y * 100 + b * 10_000) as u16);
        cog.epsg = 32613;
        cog.origin = (490_000.0, 4_420_000.0);
        cog.pixel_size = (10.0, 10.0);
        cog.nodata = Some(0.0);
        cog.overviews = 2;

        let reader = open(&cog).await;
        let header = reader.header();
        assert_eq!((header.width(), header.height(), header.bands), (40, 24, 3));
        assert_eq!(header.data_type, CogDataType::UInt16);
        assert_eq!(header.crs_code, Some(32613));
        assert_eq!(header.nodata, Some(0.0));
        assert_eq!(header.levels.len(), 3);
        assert_eq!((header.levels[1].width, header.levels[2].width), (20, 10));
        assert_eq!(header.levels[0].blocks_across, 3);

        let gt = header.geo_transform.unwrap();
        assert_eq!(gt.pixel_to_world(0.0, 0.0), (490_000.0, 4_420_000.0));
        assert_eq!(gt.pixel_to_world(1.0, 1.0), (490_010.0, 4_419_990.0));
    }

    #[tokio::test]
    async fn test_read_blocks_uncompressed_and_deflate() {
        for deflate in [false, true] {
            let mut cog = TestCog::from_fn(40, 24, 2, |x, y, b| (x + y * 100 + b * 10_000) as u16);
            cog.deflate = deflate;
            let reader = open(&cog).await;
            let level = &reader.header().levels[0];

            // Block 4: second block row, second column -> origin (16, 16)
            assert_eq!(level.block_origin(4), (16, 16));
            let block = reader.read_block(0, 4).await.unwrap();
            assert_eq!(block.len(), 16 * 16 * 2);
            // Pixel (3, 2) inside the block is image pixel (19, 18)
            let idx = (2 * 16 + 3) * 2;
            assert_eq!(block[idx], (19 + 18 * 100) as f32);
            assert_eq!(block[idx + 1], (19 + 18 * 100 + 10_000) as f32);
        }
    }

    #[tokio::test]
    async fn test_read_overview_block() {
        let mut cog = TestCog::from_fn(32, 32, 1, |x, y, _| (x + y * 100) as u16);
        cog.overviews = 1;
        let reader = open(&cog).await;
        let block = reader.read_block(1, 0).await.unwrap();
        // Overview pixel (1, 1) is full-res pixel (2, 2)
        assert_eq!(block[16 + 1], 202.0);
        assert_eq!(reader.header().best_level_for(1.0), 0);
        assert_eq!(reader.header().best_level_for(2.5), 1);
    }

    #[tokio::test]
    async fn test_invalid_signature_is_server_error() {
        let reader: Arc<dyn RangeReader> = Arc::new(MemoryRangeReader::new("mem://bad", b"not a tiff".to_vec()));
        let err = CogReader::open(reader).await.err().unwrap();
        assert!(matches!(err, MosaicError::AssetServerError(ref m) if m.contains("Invalid TIFF signature")), "{err:?}");
    }

    #[tokio::test]
    async fn test_block_index_out_of_range() {
        let cog = TestCog::from_fn(16, 16, 1, |_, _, _| 1);
        let reader = open(&cog).await;
        assert!(reader.read_block(0, 1).await.is_err());
        assert!(reader.read_block(3, 0).await.is_err());
    }
}
