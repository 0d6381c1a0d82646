//! Binary calibration image
//!
//! Image layout (all integers big-endian):
//! - 4 bytes: magic `AKCL`
//! - 1 byte: format version
//! - 1 byte: table count
//! - per table: 1 byte name length, name (UTF-8), 4 bytes blob length, blob
//! - 7 x 4 bytes: scalars, followed by a CRC32 of the whole image so far
//!
//! Table blob:
//! - 1 byte: rank
//! - rank x 2 bytes: axis lengths
//! - axis breakpoints then grid values, 4 bytes each (signed)
//! - 4 bytes: CRC32 of the preceding blob bytes

use byteorder::{BigEndian, ByteOrder};
use crc32fast::Hasher;
use std::collections::BTreeMap;

use super::{CalibrationDocument, CalibrationError, CalibrationScalars, RawTable};

/// Leading bytes of every calibration image
pub const IMAGE_MAGIC: [u8; 4] = *b"AKCL";

/// Image format version written by this crate
pub const IMAGE_VERSION: u8 = 1;

const MAX_RANK: usize = 3;

fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Narrow a length to its field width, refusing to truncate.
fn fit<T: TryFrom<usize>>(what: &'static str, len: usize, max: usize) -> Result<T, CalibrationError> {
    T::try_from(len).map_err(|_| CalibrationError::TooLarge { what, len, max })
}

fn put_u16(out: &mut Vec<u8>, value: u16) {
    let mut buf = [0u8; 2];
    BigEndian::write_u16(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 4];
    BigEndian::write_u32(&mut buf, value);
    out.extend_from_slice(&buf);
}

fn put_i32(out: &mut Vec<u8>, value: i32) {
    let mut buf = [0u8; 4];
    BigEndian::write_i32(&mut buf, value);
    out.extend_from_slice(&buf);
}

/// Bounds-checked forward reader over an image.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CalibrationError> {
        let end = self.pos.checked_add(len).ok_or(CalibrationError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(CalibrationError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CalibrationError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CalibrationError> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, CalibrationError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    fn i32s(&mut self, count: usize) -> Result<Vec<i32>, CalibrationError> {
        let bytes = self.take(count.checked_mul(4).ok_or(CalibrationError::Truncated)?)?;
        Ok(bytes.chunks_exact(4).map(BigEndian::read_i32).collect())
    }

    fn consumed(&self) -> &'a [u8] {
        &self.data[..self.pos]
    }

    fn is_at_end(&self) -> bool {
        self.pos == self.data.len()
    }
}

impl RawTable {
    /// Encode this table as a CRC-protected blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CalibrationError> {
        let points: usize = self.axes.iter().map(Vec::len).sum();
        let mut out = Vec::with_capacity(1 + 2 * self.axes.len() + 4 * (points + self.values.len()) + 4);

        out.push(fit("table rank", self.axes.len(), u8::MAX.into())?);
        for axis in &self.axes {
            put_u16(&mut out, fit("axis length", axis.len(), u16::MAX.into())?);
        }
        for &p in self.axes.iter().flatten() {
            put_i32(&mut out, p);
        }
        for &v in &self.values {
            put_i32(&mut out, v);
        }

        let crc = crc_of(&out);
        put_u32(&mut out, crc);
        Ok(out)
    }

    /// Decode a blob, verifying its CRC. Axis ordering and grid size are
    /// checked later, when the raw table is converted to a typed one.
    pub fn from_bytes(data: &[u8]) -> Result<Self, CalibrationError> {
        if data.len() < 5 {
            return Err(CalibrationError::Truncated);
        }
        let (body, trailer) = data.split_at(data.len() - 4);
        let stored = BigEndian::read_u32(trailer);
        let computed = crc_of(body);
        if stored != computed {
            return Err(CalibrationError::CrcMismatch {
                expected: computed,
                actual: stored,
            });
        }

        let mut cur = Cursor::new(body);
        let rank = cur.u8()? as usize;
        if rank == 0 || rank > MAX_RANK {
            return Err(CalibrationError::RankMismatch {
                expected: MAX_RANK,
                actual: rank,
            });
        }

        let mut lengths = Vec::with_capacity(rank);
        for _ in 0..rank {
            lengths.push(cur.u16()? as usize);
        }

        let mut axes = Vec::with_capacity(rank);
        for &len in &lengths {
            axes.push(cur.i32s(len)?);
        }

        let remaining = body.len() - cur.consumed().len();
        if remaining % 4 != 0 {
            return Err(CalibrationError::Truncated);
        }
        let values = cur.i32s(remaining / 4)?;

        Ok(Self { axes, values })
    }
}

impl CalibrationDocument {
    /// Encode the document as a binary image.
    ///
    /// Fails if a count or length exceeds its field in the image layout.
    pub fn to_image(&self) -> Result<Vec<u8>, CalibrationError> {
        let mut out = Vec::new();
        out.extend_from_slice(&IMAGE_MAGIC);
        out.push(IMAGE_VERSION);
        out.push(fit("table count", self.tables.len(), u8::MAX.into())?);

        for (name, table) in &self.tables {
            out.push(fit("table name length", name.len(), u8::MAX.into())?);
            out.extend_from_slice(name.as_bytes());
            let blob = table.to_bytes().map_err(|e| e.in_table(name))?;
            put_u32(&mut out, fit("table blob length", blob.len(), u32::MAX as usize)?);
            out.extend_from_slice(&blob);
        }

        for value in self.scalars.to_array() {
            put_u32(&mut out, value);
        }

        let crc = crc_of(&out);
        put_u32(&mut out, crc);
        Ok(out)
    }

    /// Decode a binary image. Every table blob and the image as a whole must
    /// pass their CRC checks.
    pub fn from_image(data: &[u8]) -> Result<Self, CalibrationError> {
        let mut cur = Cursor::new(data);

        if cur.take(IMAGE_MAGIC.len())? != IMAGE_MAGIC {
            return Err(CalibrationError::BadMagic);
        }
        let version = cur.u8()?;
        if version != IMAGE_VERSION {
            return Err(CalibrationError::UnsupportedVersion(version));
        }

        let count = cur.u8()?;
        let mut tables = BTreeMap::new();
        for _ in 0..count {
            let name_len = cur.u8()? as usize;
            let name = std::str::from_utf8(cur.take(name_len)?)
                .map_err(|_| CalibrationError::InvalidName)?
                .to_string();
            let blob_len = cur.u32()? as usize;
            let table = RawTable::from_bytes(cur.take(blob_len)?).map_err(|e| e.in_table(&name))?;
            tables.insert(name, table);
        }

        let mut scalars = [0u32; CalibrationScalars::COUNT];
        for slot in &mut scalars {
            *slot = cur.u32()?;
        }

        let computed = crc_of(cur.consumed());
        let stored = cur.u32()?;
        if stored != computed {
            return Err(CalibrationError::CrcMismatch {
                expected: computed,
                actual: stored,
            });
        }
        if !cur.is_at_end() {
            return Err(CalibrationError::Truncated);
        }

        Ok(Self {
            tables,
            scalars: CalibrationScalars::from_array(scalars),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::CalibrationSet;

    #[test]
    fn test_table_blob_roundtrip() {
        let raw = RawTable {
            axes: vec![vec![0, 10], vec![-5, 5, 15]],
            values: vec![1, 2, 3, -4, -5, -6],
        };
        let bytes = raw.to_bytes().unwrap();
        assert_eq!(bytes[0], 2);
        assert_eq!(RawTable::from_bytes(&bytes).unwrap(), raw);
    }

    #[test]
    fn test_flipped_bit_fails_crc() {
        let raw = RawTable {
            axes: vec![vec![0, 10]],
            values: vec![1, 2],
        };
        let mut bytes = raw.to_bytes().unwrap();
        bytes[4] ^= 0x01;
        assert!(matches!(
            RawTable::from_bytes(&bytes),
            Err(CalibrationError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_image_roundtrip() {
        let doc = CalibrationSet::fallback().to_document();
        let image = doc.to_image().unwrap();
        assert_eq!(&image[..4], b"AKCL");
        assert_eq!(CalibrationDocument::from_image(&image).unwrap(), doc);
    }

    #[test]
    fn test_image_rejects_bad_magic_and_truncation() {
        let image = CalibrationSet::fallback().to_document().to_image().unwrap();

        let mut bad = image.clone();
        bad[0] = b'X';
        assert!(matches!(
            CalibrationDocument::from_image(&bad),
            Err(CalibrationError::BadMagic)
        ));

        assert!(CalibrationDocument::from_image(&image[..image.len() - 2]).is_err());
    }

    #[test]
    fn test_oversized_axis_refused() {
        let raw = RawTable {
            axes: vec![(0..70_000).collect()],
            values: vec![0; 70_000],
        };
        assert!(matches!(
            raw.to_bytes(),
            Err(CalibrationError::TooLarge {
                what: "axis length",
                len: 70_000,
                max: 65_535,
            })
        ));
    }

    #[test]
    fn test_long_table_name_refused() {
        let mut doc = CalibrationSet::fallback().to_document();
        let raw = doc.tables.values().next().cloned().unwrap();
        doc.tables.insert("x".repeat(300), raw);

        assert!(matches!(
            doc.to_image(),
            Err(CalibrationError::TooLarge {
                what: "table name length",
                len: 300,
                ..
            })
        ));
    }

    #[test]
    fn test_too_many_tables_refused() {
        let mut doc = CalibrationSet::fallback().to_document();
        let raw = doc.tables.values().next().cloned().unwrap();
        for i in 0..256 {
            doc.tables.insert(format!("extra_{}", i), raw.clone());
        }

        assert!(matches!(
            doc.to_image(),
            Err(CalibrationError::TooLarge {
                what: "table count",
                ..
            })
        ));
    }
}
