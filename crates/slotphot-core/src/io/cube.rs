use std::ops::Range;
use std::path::Path;

use ndarray::{s, Array2, Array3};
use tracing::info;

use crate::error::{PhotError, Result};
use crate::io::npy::NpyFile;

enum Storage {
    Memory(Array3<f64>),
    Mapped {
        file: NpyFile,
        channel: Option<usize>,
        n_channels: usize,
    },
}

/// Read-only image cube: an ordered sequence of equally shaped 2-D frames.
///
/// Frames are addressed relative to the selected subset, so frame 0 is the
/// first frame of the subset.
pub struct ImageCube {
    storage: Storage,
    frame_shape: (usize, usize),
    subset: Range<usize>,
}

impl ImageCube {
    /// Wrap an in-memory `(n_frames, rows, cols)` array.
    pub fn from_array(data: Array3<f64>) -> Self {
        let (n, h, w) = data.dim();
        Self {
            storage: Storage::Memory(data),
            frame_shape: (h, w),
            subset: 0..n,
        }
    }

    /// Memory-map a `.npy` cube of shape `(n, rows, cols)` or
    /// `(n, channels, rows, cols)`. A channel must be given for 4-D cubes.
    pub fn open(path: &Path, channel: Option<usize>) -> Result<Self> {
        let file = NpyFile::open(path)?;
        let shape = file.shape().to_vec();
        let (n, n_channels, h, w) = match shape.as_slice() {
            &[n, h, w] => (n, 1, h, w),
            &[n, c, h, w] => {
                match channel {
                    None => return Err(PhotError::ChannelRequired { n_channels: c }),
                    Some(ch) if ch >= c => {
                        return Err(PhotError::InvalidCube(format!(
                            "channel {ch} out of range for {c} channels"
                        )))
                    }
                    _ => {}
                }
                (n, c, h, w)
            }
            other => {
                return Err(PhotError::InvalidCube(format!(
                    "expected a 3-D or 4-D array, found shape {other:?}"
                )))
            }
        };
        if h == 0 || w == 0 {
            return Err(PhotError::InvalidCube("frames have zero size".into()));
        }
        info!(
            path = %path.display(),
            frames = n,
            rows = h,
            cols = w,
            channels = n_channels,
            "Opened image cube"
        );
        Ok(Self {
            storage: Storage::Mapped {
                file,
                channel: if shape.len() == 4 { channel } else { None },
                n_channels,
            },
            frame_shape: (h, w),
            subset: 0..n,
        })
    }

    /// Restrict the cube to frames `range` of the full sequence.
    pub fn with_subset(mut self, range: Range<usize>) -> Result<Self> {
        let total = self.total_frames();
        if range.start >= range.end || range.end > total {
            return Err(PhotError::FrameIndexOutOfRange {
                index: range.end,
                total,
            });
        }
        self.subset = range;
        Ok(self)
    }

    fn total_frames(&self) -> usize {
        match &self.storage {
            Storage::Memory(a) => a.dim().0,
            Storage::Mapped { file, .. } => file.shape()[0],
        }
    }

    /// Number of frames in the selected subset.
    pub fn len(&self) -> usize {
        self.subset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subset.is_empty()
    }

    pub fn frame_shape(&self) -> (usize, usize) {
        self.frame_shape
    }

    pub fn subset(&self) -> Range<usize> {
        self.subset.clone()
    }

    /// Read frame `index` of the subset as `f64`.
    pub fn frame(&self, index: usize) -> Result<Array2<f64>> {
        if index >= self.len() {
            return Err(PhotError::FrameIndexOutOfRange {
                index,
                total: self.len(),
            });
        }
        let absolute = self.subset.start + index;
        let (h, w) = self.frame_shape;
        match &self.storage {
            Storage::Memory(a) => Ok(a.slice(s![absolute, .., ..]).to_owned()),
            Storage::Mapped {
                file,
                channel,
                n_channels,
            } => {
                let plane = absolute * n_channels + channel.unwrap_or(0);
                let mut data = vec![0.0; h * w];
                file.read_flat(plane * h * w, &mut data)?;
                Array2::from_shape_vec((h, w), data)
                    .map_err(|e| PhotError::InvalidCube(e.to_string()))
            }
        }
    }
}
