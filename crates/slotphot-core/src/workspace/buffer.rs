use std::fs::{File, OpenOptions};
use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytemuck::Pod;
use memmap2::MmapMut;
use ndarray::{Array2, ArrayD, IxDyn};
use tracing::debug;

use crate::error::{PhotError, Result};

pub(crate) const BUFFER_HEADER_SIZE: usize = 128;
const BUFFER_MAGIC: &[u8; 12] = b"SLOTPHOT-BUF";
const BUFFER_VERSION: u32 = 1;
const MAX_DIMS: usize = 12;

/// Element types that can live in a shared buffer.
pub trait Element: Pod + Send + Sync {
    const DTYPE: &'static str;
}

impl Element for f64 {
    const DTYPE: &'static str = "f64";
}
impl Element for f32 {
    const DTYPE: &'static str = "f32";
}
impl Element for i64 {
    const DTYPE: &'static str = "i64";
}
impl Element for i32 {
    const DTYPE: &'static str = "i32";
}
impl Element for u32 {
    const DTYPE: &'static str = "u32";
}

/// A fixed-shape array stored in a memory-mapped file.
///
/// Row `i` is the sub-array at index `i` of the leading axis. Rows may be
/// read and written through a shared reference from any thread. Writers must
/// own disjoint rows; the buffer takes no locks.
pub struct SharedArray<T: Element> {
    name: String,
    path: PathBuf,
    shape: Vec<usize>,
    row_len: usize,
    mmap: MmapMut,
    data: *mut T,
}

// SAFETY: all access goes through bounds-checked row offsets into the
// mapping, which lives as long as `self`. Concurrent writers own disjoint
// rows, so no two threads touch the same element.
unsafe impl<T: Element> Send for SharedArray<T> {}
unsafe impl<T: Element> Sync for SharedArray<T> {}

impl<T: Element> SharedArray<T> {
    pub(crate) fn create(name: &str, path: &Path, shape: &[usize], fill: T) -> Result<Self> {
        if shape.is_empty() || shape.len() > MAX_DIMS {
            return Err(PhotError::InvalidBuffer {
                path: path.to_path_buf(),
                reason: format!("unsupported rank {}", shape.len()),
            });
        }
        let n_elements: usize = shape.iter().product();
        let size = BUFFER_HEADER_SIZE + n_elements * std::mem::size_of::<T>();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        mmap[..BUFFER_HEADER_SIZE].copy_from_slice(&encode_header::<T>(shape)?);

        let array = Self::from_mmap(name, path, shape.to_vec(), mmap);
        array.fill(fill);
        debug!(buffer = name, shape = ?shape, dtype = T::DTYPE, "Created workspace buffer");
        Ok(array)
    }

    pub(crate) fn open(name: &str, path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let (dtype, shape) = decode_header(path, &mmap)?;
        if dtype != T::DTYPE {
            return Err(PhotError::WorkspaceTypeMismatch {
                name: name.to_string(),
                expected: T::DTYPE,
                found: dtype,
            });
        }
        let n_elements: usize = shape.iter().product();
        let expected = BUFFER_HEADER_SIZE + n_elements * std::mem::size_of::<T>();
        if mmap.len() < expected {
            return Err(PhotError::InvalidBuffer {
                path: path.to_path_buf(),
                reason: format!("expected {} bytes, found {}", expected, mmap.len()),
            });
        }
        debug!(buffer = name, shape = ?shape, "Re-opened workspace buffer");
        Ok(Self::from_mmap(name, path, shape, mmap))
    }

    fn from_mmap(name: &str, path: &Path, shape: Vec<usize>, mut mmap: MmapMut) -> Self {
        let row_len = shape[1..].iter().product();
        // The mapping is page aligned and the header is a multiple of 8 bytes,
        // so the data pointer is aligned for every element type.
        let data = unsafe { mmap.as_mut_ptr().add(BUFFER_HEADER_SIZE) as *mut T };
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            shape,
            row_len,
            mmap,
            data,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of rows (length of the leading axis).
    pub fn rows(&self) -> usize {
        self.shape[0]
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.row_len
    }

    fn check_row(&self, row: usize) -> Result<()> {
        if row >= self.rows() {
            return Err(PhotError::RowOutOfRange {
                name: self.name.clone(),
                row,
                rows: self.rows(),
            });
        }
        Ok(())
    }

    /// Overwrite row `row`. `values` is truncated or zero-padded to the row length.
    pub fn write_row(&self, row: usize, values: &[T]) -> Result<()> {
        self.check_row(row)?;
        let n = values.len().min(self.row_len);
        unsafe {
            let dst = self.data.add(row * self.row_len);
            std::ptr::copy_nonoverlapping(values.as_ptr(), dst, n);
            for k in n..self.row_len {
                dst.add(k).write(T::zeroed());
            }
        }
        Ok(())
    }

    /// Copy of row `row`.
    pub fn read_row(&self, row: usize) -> Result<Vec<T>> {
        self.check_row(row)?;
        let slice =
            unsafe { std::slice::from_raw_parts(self.data.add(row * self.row_len), self.row_len) };
        Ok(slice.to_vec())
    }

    /// Row `row` shaped as the trailing axes of the buffer.
    pub fn read_row_array(&self, row: usize) -> Result<ArrayD<T>> {
        let values = self.read_row(row)?;
        ArrayD::from_shape_vec(IxDyn(&self.shape[1..]), values).map_err(|e| {
            PhotError::InvalidBuffer {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Row `row` of a 3-D buffer as an image.
    pub fn read_image(&self, row: usize) -> Result<Array2<T>> {
        if self.shape.len() != 3 {
            return Err(PhotError::InvalidBuffer {
                path: self.path.clone(),
                reason: format!("buffer of rank {} holds no images", self.shape.len()),
            });
        }
        let values = self.read_row(row)?;
        Array2::from_shape_vec((self.shape[1], self.shape[2]), values).map_err(|e| {
            PhotError::InvalidBuffer {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Element at flat offset `index`.
    pub fn get(&self, index: usize) -> Option<T> {
        let total = self.rows() * self.row_len;
        (index < total).then(|| unsafe { self.data.add(index).read() })
    }

    /// Set the element at flat offset `index`. Same ownership rules as rows.
    pub fn set(&self, index: usize, value: T) -> Result<()> {
        if index >= self.rows() * self.row_len {
            return Err(PhotError::RowOutOfRange {
                name: self.name.clone(),
                row: index / self.row_len.max(1),
                rows: self.rows(),
            });
        }
        unsafe { self.data.add(index).write(value) };
        Ok(())
    }

    /// Whole buffer as an n-dimensional array.
    pub fn to_array(&self) -> Result<ArrayD<T>> {
        let total = self.rows() * self.row_len;
        let slice = unsafe { std::slice::from_raw_parts(self.data, total) };
        ArrayD::from_shape_vec(IxDyn(&self.shape), slice.to_vec()).map_err(|e| {
            PhotError::InvalidBuffer {
                path: self.path.clone(),
                reason: e.to_string(),
            }
        })
    }

    /// Set every element to `value`.
    pub fn fill(&self, value: T) {
        let total = self.rows() * self.row_len;
        for k in 0..total {
            unsafe { self.data.add(k).write(value) };
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

fn encode_header<T: Element>(shape: &[usize]) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(BUFFER_HEADER_SIZE);
    header.extend_from_slice(BUFFER_MAGIC);
    header.write_u32::<LittleEndian>(BUFFER_VERSION)?;
    let mut dtype = [0u8; 8];
    dtype[..T::DTYPE.len()].copy_from_slice(T::DTYPE.as_bytes());
    header.extend_from_slice(&dtype);
    header.write_u32::<LittleEndian>(shape.len() as u32)?;
    header.write_u32::<LittleEndian>(0)?;
    for &d in shape {
        header.write_u64::<LittleEndian>(d as u64)?;
    }
    header.resize(BUFFER_HEADER_SIZE, 0);
    Ok(header)
}

fn decode_header(path: &Path, buf: &[u8]) -> Result<(String, Vec<usize>)> {
    let invalid = |reason: &str| PhotError::InvalidBuffer {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if buf.len() < BUFFER_HEADER_SIZE {
        return Err(invalid("file too small for header"));
    }
    if &buf[..12] != BUFFER_MAGIC {
        return Err(invalid("missing magic"));
    }
    let mut cursor = Cursor::new(&buf[12..BUFFER_HEADER_SIZE]);
    let version = cursor.read_u32::<LittleEndian>()?;
    if version != BUFFER_VERSION {
        return Err(invalid(&format!("unsupported version {version}")));
    }
    let dtype = String::from_utf8_lossy(&buf[16..24])
        .trim_end_matches('\0')
        .to_string();
    let mut cursor = Cursor::new(&buf[24..BUFFER_HEADER_SIZE]);
    let ndim = cursor.read_u32::<LittleEndian>()? as usize;
    let _reserved = cursor.read_u32::<LittleEndian>()?;
    if ndim == 0 || ndim > MAX_DIMS {
        return Err(invalid(&format!("bad rank {ndim}")));
    }
    let shape = (0..ndim)
        .map(|_| cursor.read_u64::<LittleEndian>().map(|d| d as usize))
        .collect::<std::io::Result<Vec<_>>>()?;
    Ok((dtype, shape))
}

/// Peek at the shape and element type of an existing buffer file.
pub fn inspect(path: &Path) -> Result<(String, Vec<usize>)> {
    let mut file = File::open(path)?;
    let mut header = vec![0u8; BUFFER_HEADER_SIZE];
    std::io::Read::read_exact(&mut file, &mut header)?;
    decode_header(path, &header)
}
