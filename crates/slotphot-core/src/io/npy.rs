use std::fs::File;
use std::io::Cursor;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use memmap2::Mmap;

use crate::error::{PhotError, Result};

const NPY_MAGIC: &[u8; 6] = b"\x93NUMPY";

/// Element types understood by the reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NpyDtype {
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    F64,
}

impl NpyDtype {
    pub fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Parsed `.npy` header.
#[derive(Clone, Debug)]
pub struct NpyHeader {
    pub dtype: NpyDtype,
    pub little_endian: bool,
    pub shape: Vec<usize>,
    /// Byte offset of the first element.
    pub data_offset: usize,
}

/// Memory-mapped reader for C-ordered `.npy` arrays.
pub struct NpyFile {
    mmap: Mmap,
    pub header: NpyHeader,
}

impl NpyFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let header = parse_header(&mmap)?;

        let n_elements: usize = header.shape.iter().product();
        let expected = header.data_offset + n_elements * header.dtype.size();
        if mmap.len() < expected {
            return Err(PhotError::InvalidCube(format!(
                "File truncated: expected at least {} bytes, got {}",
                expected,
                mmap.len()
            )));
        }
        Ok(Self { mmap, header })
    }

    pub fn shape(&self) -> &[usize] {
        &self.header.shape
    }

    /// Decode `count` consecutive elements starting at flat index `start`.
    pub fn read_flat(&self, start: usize, out: &mut [f64]) -> Result<()> {
        let size = self.header.dtype.size();
        let begin = self.header.data_offset + start * size;
        let end = begin + out.len() * size;
        if end > self.mmap.len() {
            return Err(PhotError::InvalidCube(format!(
                "read of {} elements at {start} runs past the end of the data",
                out.len()
            )));
        }
        let raw = &self.mmap[begin..end];
        if self.header.little_endian {
            decode::<LittleEndian>(raw, self.header.dtype, out);
        } else {
            decode::<BigEndian>(raw, self.header.dtype, out);
        }
        Ok(())
    }
}

fn decode<B: ByteOrder>(raw: &[u8], dtype: NpyDtype, out: &mut [f64]) {
    let size = dtype.size();
    for (v, chunk) in out.iter_mut().zip(raw.chunks_exact(size)) {
        *v = match dtype {
            NpyDtype::U8 => chunk[0] as f64,
            NpyDtype::I16 => B::read_i16(chunk) as f64,
            NpyDtype::U16 => B::read_u16(chunk) as f64,
            NpyDtype::I32 => B::read_i32(chunk) as f64,
            NpyDtype::U32 => B::read_u32(chunk) as f64,
            NpyDtype::F32 => B::read_f32(chunk) as f64,
            NpyDtype::F64 => B::read_f64(chunk),
        };
    }
}

fn parse_header(buf: &[u8]) -> Result<NpyHeader> {
    if buf.len() < 10 || &buf[0..6] != NPY_MAGIC {
        return Err(PhotError::InvalidCube("Missing NUMPY magic".into()));
    }
    let major = buf[6];
    let mut cursor = Cursor::new(&buf[8..]);
    let (header_len, prefix) = match major {
        1 => (cursor.read_u16::<LittleEndian>()? as usize, 10),
        2 | 3 => (cursor.read_u32::<LittleEndian>()? as usize, 12),
        v => {
            return Err(PhotError::InvalidCube(format!(
                "Unsupported npy format version {v}"
            )))
        }
    };
    let data_offset = prefix + header_len;
    if buf.len() < data_offset {
        return Err(PhotError::InvalidCube("Header truncated".into()));
    }
    let dict = String::from_utf8_lossy(&buf[prefix..data_offset]);

    let descr = dict_value(&dict, "descr")
        .map(|s| s.trim_matches(|c| c == '\'' || c == '"').to_string())
        .ok_or_else(|| PhotError::InvalidCube("Header has no 'descr'".into()))?;
    let (dtype, little_endian) = parse_descr(&descr)?;

    let fortran = dict_value(&dict, "fortran_order").unwrap_or("False");
    if fortran.starts_with("True") {
        return Err(PhotError::InvalidCube(
            "Fortran-ordered arrays are not supported".into(),
        ));
    }

    let shape = parse_shape(&dict)?;
    Ok(NpyHeader {
        dtype,
        little_endian,
        shape,
        data_offset,
    })
}

/// Raw text following `'key':` up to the next top-level comma.
fn dict_value<'a>(dict: &'a str, key: &str) -> Option<&'a str> {
    let start = dict.find(&format!("'{key}'"))? + key.len() + 2;
    let rest = dict[start..].trim_start().strip_prefix(':')?.trim_start();
    let end = rest.find([',', '}']).unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn parse_descr(descr: &str) -> Result<(NpyDtype, bool)> {
    let mut chars = descr.chars();
    let order = chars.next().unwrap_or('|');
    let little_endian = match order {
        '<' | '|' | '=' => true,
        '>' => false,
        _ => return Err(PhotError::InvalidCube(format!("Bad dtype '{descr}'"))),
    };
    let dtype = match chars.as_str() {
        "u1" => NpyDtype::U8,
        "i2" => NpyDtype::I16,
        "u2" => NpyDtype::U16,
        "i4" => NpyDtype::I32,
        "u4" => NpyDtype::U32,
        "f4" => NpyDtype::F32,
        "f8" => NpyDtype::F64,
        other => {
            return Err(PhotError::InvalidCube(format!(
                "Unsupported dtype '{other}'"
            )))
        }
    };
    Ok((dtype, little_endian))
}

fn parse_shape(dict: &str) -> Result<Vec<usize>> {
    let start = dict
        .find("'shape'")
        .and_then(|i| dict[i..].find('(').map(|j| i + j + 1))
        .ok_or_else(|| PhotError::InvalidCube("Header has no 'shape'".into()))?;
    let end = dict[start..]
        .find(')')
        .map(|j| start + j)
        .ok_or_else(|| PhotError::InvalidCube("Unterminated shape tuple".into()))?;
    dict[start..end]
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| PhotError::InvalidCube(format!("Bad shape entry '{s}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_descr() {
        assert_eq!(parse_descr("<f4").unwrap(), (NpyDtype::F32, true));
        assert_eq!(parse_descr(">u2").unwrap(), (NpyDtype::U16, false));
        assert_eq!(parse_descr("|u1").unwrap(), (NpyDtype::U8, true));
        assert!(parse_descr("<c8").is_err());
    }

    #[test]
    fn test_parse_shape() {
        let dict = "{'descr': '<f8', 'fortran_order': False, 'shape': (20, 64, 32), }";
        assert_eq!(parse_shape(dict).unwrap(), vec![20, 64, 32]);
        assert_eq!(dict_value(dict, "descr"), Some("'<f8'"));
    }
}
