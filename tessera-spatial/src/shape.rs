//! Cell outlines stored as single-record ESRI Shapefile (SHP) polygons.
//!
//! The blob layout is the SHP main file: a 100-byte header followed by one
//! polygon record, base64-encoded for storage in `shape_file`. Header
//! integers mix big-endian (file code, lengths) and little-endian (version,
//! shape type); all doubles are little-endian.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use tessera_core::{Result, TesseraError};

/// Value of the `shape_file.format` column for every stored outline.
pub const SHAPE_FILE_FORMAT: &str = "ESRI Shapefile SHP";

const FILE_CODE: i32 = 9994;
const VERSION: i32 = 1000;
const HEADER_LEN: usize = 100;
const RECORD_HEADER_LEN: usize = 8;
/// Shape type, bounding box, part count, point count, one part offset.
const POLYGON_FIXED_LEN: usize = 4 + 32 + 4 + 4 + 4;

/// A point in slide pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance.
    pub fn distance(&self, other: &Point) -> f64 {
        self.distance_squared(other).sqrt()
    }

    pub fn distance_squared(&self, other: &Point) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Shape types defined by the SHP format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeType {
    Null,
    Point,
    PolyLine,
    Polygon,
    MultiPoint,
    PointZ,
    PolyLineZ,
    PolygonZ,
    MultiPointZ,
    PointM,
    PolyLineM,
    PolygonM,
    MultiPointM,
    MultiPatch,
}

impl ShapeType {
    pub fn from_code(code: i32) -> Option<Self> {
        let t = match code {
            0 => ShapeType::Null,
            1 => ShapeType::Point,
            3 => ShapeType::PolyLine,
            5 => ShapeType::Polygon,
            8 => ShapeType::MultiPoint,
            11 => ShapeType::PointZ,
            13 => ShapeType::PolyLineZ,
            15 => ShapeType::PolygonZ,
            18 => ShapeType::MultiPointZ,
            21 => ShapeType::PointM,
            23 => ShapeType::PolyLineM,
            25 => ShapeType::PolygonM,
            28 => ShapeType::MultiPointM,
            31 => ShapeType::MultiPatch,
            _ => return None,
        };
        Some(t)
    }

    pub fn code(&self) -> i32 {
        match self {
            ShapeType::Null => 0,
            ShapeType::Point => 1,
            ShapeType::PolyLine => 3,
            ShapeType::Polygon => 5,
            ShapeType::MultiPoint => 8,
            ShapeType::PointZ => 11,
            ShapeType::PolyLineZ => 13,
            ShapeType::PolygonZ => 15,
            ShapeType::MultiPointZ => 18,
            ShapeType::PointM => 21,
            ShapeType::PolyLineM => 23,
            ShapeType::PolygonM => 25,
            ShapeType::MultiPointM => 28,
            ShapeType::MultiPatch => 31,
        }
    }

    /// Upper-case name as reported by shapefile readers.
    pub fn name(&self) -> &'static str {
        match self {
            ShapeType::Null => "NULL",
            ShapeType::Point => "POINT",
            ShapeType::PolyLine => "POLYLINE",
            ShapeType::Polygon => "POLYGON",
            ShapeType::MultiPoint => "MULTIPOINT",
            ShapeType::PointZ => "POINTZ",
            ShapeType::PolyLineZ => "POLYLINEZ",
            ShapeType::PolygonZ => "POLYGONZ",
            ShapeType::MultiPointZ => "MULTIPOINTZ",
            ShapeType::PointM => "POINTM",
            ShapeType::PolyLineM => "POLYLINEM",
            ShapeType::PolygonM => "POLYGONM",
            ShapeType::MultiPointM => "MULTIPOINTM",
            ShapeType::MultiPatch => "MULTIPATCH",
        }
    }
}

/// A simple polygon stored as a closed ring (last vertex repeats the first).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Polygon {
    ring: Vec<Point>,
}

impl Polygon {
    /// Build a polygon from ring vertices, closing the ring if needed.
    ///
    /// The ring needs at least 3 vertices besides the closing one.
    pub fn new(mut vertices: Vec<Point>) -> Result<Self> {
        if let (Some(&first), Some(&last)) = (vertices.first(), vertices.last()) {
            if first != last {
                vertices.push(first);
            }
        }
        if vertices.len() < 4 {
            return Err(TesseraError::MalformedShape(format!(
                "polygon ring needs at least 3 vertices, got {}",
                vertices.len().saturating_sub(1)
            )));
        }
        Ok(Self { ring: vertices })
    }

    /// Rectangle (xmin, ymin), (xmin, ymax), (xmax, ymax), (xmax, ymin).
    pub fn from_bounding_box(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self {
            ring: vec![
                Point::new(xmin, ymin),
                Point::new(xmin, ymax),
                Point::new(xmax, ymax),
                Point::new(xmax, ymin),
                Point::new(xmin, ymin),
            ],
        }
    }

    /// The closed ring.
    pub fn ring(&self) -> &[Point] {
        &self.ring
    }

    /// The ring without its closing vertex.
    pub fn open_ring(&self) -> &[Point] {
        &self.ring[..self.ring.len() - 1]
    }

    /// Arithmetic mean of the distinct ring vertices.
    pub fn centroid(&self) -> Point {
        let open = self.open_ring();
        let n = open.len() as f64;
        let (sx, sy) = open
            .iter()
            .fold((0.0, 0.0), |(sx, sy), p| (sx + p.x, sy + p.y));
        Point::new(sx / n, sy / n)
    }

    /// Enclosed area by the shoelace formula, independent of orientation.
    pub fn area(&self) -> f64 {
        let twice: f64 = self
            .ring
            .windows(2)
            .map(|w| w[0].x * w[1].y - w[1].x * w[0].y)
            .sum();
        twice.abs() / 2.0
    }

    /// `[xmin, ymin, xmax, ymax]`.
    pub fn bounding_box(&self) -> [f64; 4] {
        self.ring.iter().fold(
            [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY],
            |[x0, y0, x1, y1], p| [x0.min(p.x), y0.min(p.y), x1.max(p.x), y1.max(p.y)],
        )
    }

    // -- SHP codec ---------------------------------------------------------

    /// Serialize as an SHP main file holding this polygon as record 1.
    pub fn to_shp_bytes(&self) -> Vec<u8> {
        let content_len = POLYGON_FIXED_LEN + 16 * self.ring.len();
        let file_len = HEADER_LEN + RECORD_HEADER_LEN + content_len;
        let bbox = self.bounding_box();

        let mut out = Vec::with_capacity(file_len);
        out.extend_from_slice(&FILE_CODE.to_be_bytes());
        out.extend_from_slice(&[0u8; 20]);
        out.extend_from_slice(&((file_len / 2) as i32).to_be_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&ShapeType::Polygon.code().to_le_bytes());
        for v in bbox {
            out.extend_from_slice(&v.to_le_bytes());
        }
        // Z and M ranges are unused for 2-D polygons.
        out.extend_from_slice(&[0u8; 32]);

        out.extend_from_slice(&1i32.to_be_bytes());
        out.extend_from_slice(&((content_len / 2) as i32).to_be_bytes());

        out.extend_from_slice(&ShapeType::Polygon.code().to_le_bytes());
        for v in bbox {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&1i32.to_le_bytes());
        out.extend_from_slice(&(self.ring.len() as i32).to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        for p in &self.ring {
            out.extend_from_slice(&p.x.to_le_bytes());
            out.extend_from_slice(&p.y.to_le_bytes());
        }
        out
    }

    /// Parse the first polygon record of an SHP main file. Only the first
    /// part of a multi-part record is kept.
    pub fn from_shp_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(bytes);

        let file_code = r.i32_be()?;
        if file_code != FILE_CODE {
            return Err(TesseraError::MalformedShape(format!(
                "bad file code {}",
                file_code
            )));
        }
        r.skip(20)?;
        let _file_len = r.i32_be()?;
        let _version = r.i32_le()?;
        check_polygon(r.i32_le()?)?;
        r.skip(64)?;

        let _record_number = r.i32_be()?;
        let _content_words = r.i32_be()?;
        check_polygon(r.i32_le()?)?;
        r.skip(32)?;
        let num_parts = r.count()?;
        let num_points = r.count()?;
        if num_parts == 0 || num_points == 0 {
            return Err(TesseraError::MalformedShape("polygon record is empty".into()));
        }
        let needed = num_parts
            .checked_mul(4)
            .zip(num_points.checked_mul(16))
            .and_then(|(a, b)| a.checked_add(b));
        if needed.map_or(true, |n| n > r.remaining()) {
            return Err(TesseraError::MalformedShape(format!(
                "{} parts and {} points exceed the {} bytes left in the record",
                num_parts,
                num_points,
                r.remaining()
            )));
        }
        let mut parts = Vec::with_capacity(num_parts);
        for _ in 0..num_parts {
            parts.push(r.count()?);
        }
        let start = parts[0];
        let end = parts.get(1).copied().unwrap_or(num_points);
        if start >= end || end > num_points {
            return Err(TesseraError::MalformedShape(format!(
                "invalid part offsets {:?} for {} points",
                parts, num_points
            )));
        }

        r.skip(16 * start)?;
        let mut ring = Vec::with_capacity(end - start + 1);
        for _ in start..end {
            let x = r.f64_le()?;
            let y = r.f64_le()?;
            ring.push(Point::new(x, y));
        }
        Polygon::new(ring)
    }

    /// SHP bytes, base64-encoded.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.to_shp_bytes())
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| TesseraError::MalformedShape(format!("invalid base64: {}", e)))?;
        Polygon::from_shp_bytes(&bytes)
    }
}

fn check_polygon(code: i32) -> Result<()> {
    match ShapeType::from_code(code) {
        Some(t) if t == ShapeType::Polygon && t.name() == "POLYGON" => Ok(()),
        Some(t) => Err(TesseraError::MalformedShape(format!(
            "expected POLYGON, found {} (type {})",
            t.name(),
            code
        ))),
        None => Err(TesseraError::MalformedShape(format!(
            "unknown shape type {}",
            code
        ))),
    }
}

struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        let end = self.pos + N;
        let slice = self.bytes.get(self.pos..end).ok_or_else(|| {
            TesseraError::MalformedShape(format!(
                "truncated at byte {} of {}",
                self.pos,
                self.bytes.len()
            ))
        })?;
        let mut buf = [0u8; N];
        buf.copy_from_slice(slice);
        self.pos = end;
        Ok(buf)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if n > self.remaining() {
            return Err(TesseraError::MalformedShape(format!(
                "truncated at byte {} of {}",
                self.pos,
                self.bytes.len()
            )));
        }
        self.pos += n;
        Ok(())
    }

    fn i32_be(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    fn i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take()?))
    }

    fn f64_le(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take()?))
    }

    fn count(&mut self) -> Result<usize> {
        let v = self.i32_le()?;
        usize::try_from(v)
            .map_err(|_| TesseraError::MalformedShape(format!("negative count {}", v)))
    }
}
