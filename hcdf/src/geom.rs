//! Hyperslab arithmetic: selections, row-major placement and chunk partitioning.
//!
use crate::errors::{Error, Result};

/// A region of a variable, selected for reading or writing.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// Every element of the variable
    All,

    /// A single element at a fully specified coordinate
    Point(Vec<usize>),

    /// `count[i]` consecutive elements along each axis `i`, beginning at `start[i]`
    Slab { start: Vec<usize>, count: Vec<usize> },

    /// `count[i]` elements along each axis `i`, sampled every `stride[i]` positions, beginning
    /// at `start[i]`
    Strided {
        start: Vec<usize>,
        count: Vec<usize>,
        stride: Vec<usize>,
    },
}

impl Selection {
    /// Turn the selection into an explicit hyperslab for a variable of the given shape.
    ///
    /// Checks ranks, strides and that every selected index is addressable. Bounds are checked
    /// by the caller, which knows which axes may grow.
    ///
    pub(crate) fn resolve(&self, shape: &[usize]) -> Result<Hyperslab> {
        let rank = shape.len();
        let slab = match self {
            Selection::All => Hyperslab {
                start: vec![0; rank],
                count: shape.to_vec(),
                stride: vec![1; rank],
            },
            Selection::Point(index) => Hyperslab {
                start: index.clone(),
                count: vec![1; index.len()],
                stride: vec![1; index.len()],
            },
            Selection::Slab { start, count } => Hyperslab {
                start: start.clone(),
                count: count.clone(),
                stride: vec![1; start.len()],
            },
            Selection::Strided {
                start,
                count,
                stride,
            } => Hyperslab {
                start: start.clone(),
                count: count.clone(),
                stride: stride.clone(),
            },
        };

        if slab.start.len() != rank || slab.count.len() != rank || slab.stride.len() != rank {
            return Err(Error::ShapeMismatch(format!(
                "selection has rank {}/{}/{}, variable has rank {rank}",
                slab.start.len(),
                slab.count.len(),
                slab.stride.len()
            )));
        }
        if slab.stride.iter().any(|stride| *stride == 0) {
            return Err(Error::ShapeMismatch(String::from("stride may not be zero")));
        }
        for axis in 0..rank {
            if slab.checked_extent(axis).is_none() {
                return Err(Error::OutOfBounds(format!(
                    "axis {axis}: start {} + {} strides of {} is not addressable",
                    slab.start[axis],
                    slab.count[axis].saturating_sub(1),
                    slab.stride[axis]
                )));
            }
        }
        if checked_elements(&slab.count).is_none() {
            return Err(Error::ShapeMismatch(format!(
                "selection of {:?} elements is too large",
                slab.count
            )));
        }

        Ok(slab)
    }
}

/// An explicit start, count and stride along every axis
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Hyperslab {
    pub start: Vec<usize>,
    pub count: Vec<usize>,
    pub stride: Vec<usize>,
}

impl Hyperslab {
    pub fn rank(&self) -> usize {
        self.start.len()
    }

    /// Number of selected elements
    pub fn len(&self) -> usize {
        checked_elements(&self.count).unwrap_or(usize::MAX)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest index selected along `axis`. Zero when nothing is selected.
    ///
    /// Slabs built by `Selection::resolve` never overflow here.
    ///
    pub fn extent(&self, axis: usize) -> usize {
        self.checked_extent(axis).unwrap_or(usize::MAX)
    }

    fn checked_extent(&self, axis: usize) -> Option<usize> {
        match self.count[axis] {
            0 => Some(0),
            count => (count - 1)
                .checked_mul(self.stride[axis])?
                .checked_add(self.start[axis])?
                .checked_add(1),
        }
    }

    /// Range of row-major element indexes spanned by the selection in an array of `shape`.
    ///
    /// The selection must not be empty.
    ///
    pub fn span(&self, shape: &[usize]) -> (usize, usize) {
        let strides = row_major_strides(shape);
        let mut first = 0;
        let mut last = 0;
        for axis in 0..self.rank() {
            first += self.start[axis] * strides[axis];
            last += (self.extent(axis) - 1) * strides[axis];
        }

        (first, last + 1)
    }
}

/// Number of elements in an array of `shape`. A scalar has one element.
pub(crate) fn elements(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Like `elements`, but `None` if the count does not fit in a `usize`
pub(crate) fn checked_elements(shape: &[usize]) -> Option<usize> {
    if shape.contains(&0) {
        return Some(0);
    }
    shape
        .iter()
        .try_fold(1_usize, |total, extent| total.checked_mul(*extent))
}

/// Distance, in elements, between neighbors along each axis of a row-major array
///
pub(crate) fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![1; shape.len()];
    for axis in (0..shape.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * shape[axis + 1];
    }

    strides
}

/// Visits every position within `counts`, last axis fastest.
///
/// A rank zero odometer has exactly one position, an odometer with any zero count has none.
///
pub(crate) struct Odometer {
    counts: Vec<usize>,
    position: Vec<usize>,
    started: bool,
    done: bool,
}

impl Odometer {
    pub fn new(counts: &[usize]) -> Self {
        Self {
            counts: counts.to_vec(),
            position: vec![0; counts.len()],
            started: false,
            done: counts.iter().any(|count| *count == 0),
        }
    }

    pub fn next_position(&mut self) -> Option<&[usize]> {
        if self.done {
            return None;
        }
        if self.started {
            let mut axis = self.counts.len();
            loop {
                if axis == 0 {
                    self.done = true;
                    return None;
                }
                axis -= 1;
                self.position[axis] += 1;
                if self.position[axis] < self.counts[axis] {
                    break;
                }
                self.position[axis] = 0;
            }
        } else {
            self.started = true;
        }

        Some(&self.position)
    }
}

/// Where a selection lives in a row-major buffer, in elements.
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Placement {
    /// Index of the first selected element
    offset: usize,

    /// Distance between selected neighbors along each axis
    step: Vec<usize>,
}

impl Placement {
    /// # Arguments
    ///
    /// * `shape` - Shape of the buffer.
    /// * `start` - Buffer coordinates of the first selected element.
    /// * `stride` - Sampling interval along each axis.
    ///
    pub fn new(shape: &[usize], start: &[usize], stride: &[usize]) -> Self {
        let strides = row_major_strides(shape);
        let offset = start.iter().zip(&strides).map(|(s, r)| s * r).sum();
        let step = stride.iter().zip(&strides).map(|(s, r)| s * r).collect();

        Self { offset, step }
    }

    /// A dense buffer holding exactly the selected elements
    pub fn dense(count: &[usize]) -> Self {
        Self::new(count, &vec![0; count.len()], &vec![1; count.len()])
    }

    /// The same placement in a buffer that begins `base` elements later
    pub fn shifted(mut self, base: usize) -> Self {
        self.offset -= base;
        self
    }
}

/// Copy `count` elements of `width` bytes between two row-major buffers.
///
pub(crate) fn copy_elements(
    count: &[usize],
    width: usize,
    source: &[u8],
    from: &Placement,
    destination: &mut [u8],
    to: &Placement,
) {
    let rank = count.len();
    if rank == 0 {
        let (src, dst) = (from.offset * width, to.offset * width);
        destination[dst..dst + width].copy_from_slice(&source[src..src + width]);
        return;
    }

    let inner = count[rank - 1];
    let (src_step, dst_step) = (from.step[rank - 1], to.step[rank - 1]);
    if inner == 0 {
        return;
    }
    let mut odometer = Odometer::new(&count[..rank - 1]);

    while let Some(position) = odometer.next_position() {
        let mut src = from.offset;
        let mut dst = to.offset;
        for (axis, index) in position.iter().enumerate() {
            src += index * from.step[axis];
            dst += index * to.step[axis];
        }

        if src_step == 1 && dst_step == 1 {
            let bytes = inner * width;
            destination[dst * width..dst * width + bytes]
                .copy_from_slice(&source[src * width..src * width + bytes]);
        } else {
            for _ in 0..inner {
                destination[dst * width..(dst + 1) * width]
                    .copy_from_slice(&source[src * width..(src + 1) * width]);
                src += src_step;
                dst += dst_step;
            }
        }
    }
}

/// The part of a hyperslab that falls within a single chunk
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ChunkPiece {
    /// Chunk coordinates, in units of chunks
    pub chunk: Vec<usize>,

    /// Position of the piece's first element within the selection
    pub first: Vec<usize>,

    /// Number of selected elements in the chunk, along each axis
    pub count: Vec<usize>,

    /// Chunk local coordinates of the piece's first element
    pub local: Vec<usize>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AxisRun {
    chunk: usize,
    first: usize,
    count: usize,
    local: usize,
}

/// Split the indexes selected along one axis into runs that share a chunk
///
fn axis_runs(start: usize, count: usize, stride: usize, extent: usize) -> Vec<AxisRun> {
    let mut runs = vec![];
    let mut k = 0;
    while k < count {
        let index = start + k * stride;
        let local = index % extent;
        let n = ((extent - local - 1) / stride + 1).min(count - k);
        runs.push(AxisRun {
            chunk: index / extent,
            first: k,
            count: n,
            local,
        });
        k += n;
    }

    runs
}

/// Partition a hyperslab into the chunks it intersects, in row-major chunk order.
///
pub(crate) fn chunk_pieces(slab: &Hyperslab, chunk_shape: &[usize]) -> Vec<ChunkPiece> {
    let runs: Vec<Vec<AxisRun>> = (0..slab.rank())
        .map(|axis| {
            axis_runs(
                slab.start[axis],
                slab.count[axis],
                slab.stride[axis],
                chunk_shape[axis],
            )
        })
        .collect();
    let counts: Vec<usize> = runs.iter().map(|axis| axis.len()).collect();

    let mut pieces = vec![];
    let mut odometer = Odometer::new(&counts);
    while let Some(position) = odometer.next_position() {
        let selected: Vec<AxisRun> = position
            .iter()
            .enumerate()
            .map(|(axis, run)| runs[axis][*run])
            .collect();
        pieces.push(ChunkPiece {
            chunk: selected.iter().map(|run| run.chunk).collect(),
            first: selected.iter().map(|run| run.first).collect(),
            count: selected.iter().map(|run| run.count).collect(),
            local: selected.iter().map(|run| run.local).collect(),
        });
    }

    pieces
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(counts: &[usize]) -> Vec<Vec<usize>> {
        let mut odometer = Odometer::new(counts);
        let mut positions = vec![];
        while let Some(position) = odometer.next_position() {
            positions.push(position.to_vec());
        }

        positions
    }

    #[test]
    fn test_odometer() {
        assert_eq!(
            positions(&[2, 3]),
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2]
            ]
        );
        assert_eq!(positions(&[]), vec![Vec::<usize>::new()]);
        assert!(positions(&[3, 0, 2]).is_empty());
    }

    #[test]
    fn test_resolve() -> Result<()> {
        let shape = [4, 5];
        assert_eq!(
            Selection::All.resolve(&shape)?,
            Hyperslab {
                start: vec![0, 0],
                count: vec![4, 5],
                stride: vec![1, 1]
            }
        );
        assert_eq!(Selection::Point(vec![1, 2]).resolve(&shape)?.len(), 1);
        assert!(matches!(
            Selection::Point(vec![1]).resolve(&shape),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            Selection::Strided {
                start: vec![0, 0],
                count: vec![1, 1],
                stride: vec![1, 0]
            }
            .resolve(&shape),
            Err(Error::ShapeMismatch(_))
        ));
        assert!(matches!(
            Selection::Slab {
                start: vec![0, 0],
                count: vec![1]
            }
            .resolve(&shape),
            Err(Error::ShapeMismatch(_))
        ));

        // Selections that run off the end of the address space
        assert!(matches!(
            Selection::Strided {
                start: vec![0, 0],
                count: vec![1, 2],
                stride: vec![1, usize::MAX]
            }
            .resolve(&shape),
            Err(Error::OutOfBounds(_))
        ));
        assert!(matches!(
            Selection::Point(vec![usize::MAX, 0]).resolve(&shape),
            Err(Error::OutOfBounds(_))
        ));
        assert!(matches!(
            Selection::Slab {
                start: vec![usize::MAX - 1, 0],
                count: vec![2, 1]
            }
            .resolve(&shape),
            Err(Error::OutOfBounds(_))
        ));
        assert!(matches!(
            Selection::Slab {
                start: vec![0, 0],
                count: vec![usize::MAX, 2]
            }
            .resolve(&shape),
            Err(Error::ShapeMismatch(_))
        ));
        let empty = Selection::Slab {
            start: vec![0, 0],
            count: vec![usize::MAX, 0],
        }
        .resolve(&shape)?;
        assert!(empty.is_empty());

        // A scalar is selected by an empty point
        let scalar = Selection::Point(vec![]).resolve(&[])?;
        assert_eq!(scalar.len(), 1);

        Ok(())
    }

    #[test]
    fn test_extent_and_span() {
        let slab = Hyperslab {
            start: vec![1, 2],
            count: vec![2, 3],
            stride: vec![2, 3],
        };
        assert_eq!(slab.extent(0), 4);
        assert_eq!(slab.extent(1), 9);
        assert_eq!(slab.span(&[5, 10]), (12, 39));

        let empty = Hyperslab {
            start: vec![3],
            count: vec![0],
            stride: vec![1],
        };
        assert_eq!(empty.extent(0), 0);
        assert!(empty.is_empty());
    }

    #[test]
    fn test_row_major_strides() {
        assert_eq!(row_major_strides(&[2, 3, 4]), vec![12, 4, 1]);
        assert_eq!(row_major_strides(&[7]), vec![1]);
        assert_eq!(row_major_strides(&[]), Vec::<usize>::new());
    }

    #[test]
    fn test_copy_elements_strided() {
        // 4x4 array of u8, take every other element starting at (1, 0)
        let source: Vec<u8> = (0..16).collect();
        let from = Placement::new(&[4, 4], &[1, 0], &[2, 2]);
        let mut destination = vec![0; 4];
        copy_elements(&[2, 2], 1, &source, &from, &mut destination, &Placement::dense(&[2, 2]));
        assert_eq!(destination, vec![4, 6, 12, 14]);
    }

    #[test]
    fn test_copy_elements_dense_wide() {
        // 3x2 array of u16 sized elements, copy the middle row into a 1x2 buffer
        let source: Vec<u8> = (0..12).collect();
        let from = Placement::new(&[3, 2], &[1, 0], &[1, 1]);
        let mut destination = vec![0; 4];
        copy_elements(&[1, 2], 2, &source, &from, &mut destination, &Placement::dense(&[1, 2]));
        assert_eq!(destination, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_copy_elements_shifted() {
        let source = vec![9, 8, 7];
        let mut destination: Vec<u8> = vec![0; 10];
        let to = Placement::new(&[10], &[6], &[1]).shifted(5);
        copy_elements(&[3], 1, &source, &Placement::dense(&[3]), &mut destination[..], &to);
        assert_eq!(destination[..4], [0, 9, 8, 7]);
    }

    #[test]
    fn test_copy_scalar() {
        let source = vec![1, 2, 3, 4];
        let mut destination = vec![0; 4];
        copy_elements(&[], 4, &source, &Placement::dense(&[]), &mut destination, &Placement::dense(&[]));
        assert_eq!(destination, source);
    }

    #[test]
    fn test_axis_runs() {
        // Indexes 1, 4, 7, 10 with chunks of 5
        assert_eq!(
            axis_runs(1, 4, 3, 5),
            vec![
                AxisRun {
                    chunk: 0,
                    first: 0,
                    count: 2,
                    local: 1
                },
                AxisRun {
                    chunk: 1,
                    first: 2,
                    count: 1,
                    local: 2
                },
                AxisRun {
                    chunk: 2,
                    first: 3,
                    count: 1,
                    local: 0
                },
            ]
        );

        // Stride larger than the chunk skips chunks entirely
        let runs = axis_runs(0, 3, 7, 2);
        assert_eq!(
            runs.iter().map(|run| run.chunk).collect::<Vec<_>>(),
            vec![0, 3, 7]
        );
    }

    #[test]
    fn test_chunk_pieces() {
        let slab = Hyperslab {
            start: vec![0, 3],
            count: vec![2, 5],
            stride: vec![1, 1],
        };
        let pieces = chunk_pieces(&slab, &[1, 4]);
        assert_eq!(pieces.len(), 4);
        assert_eq!(
            pieces[0],
            ChunkPiece {
                chunk: vec![0, 0],
                first: vec![0, 0],
                count: vec![1, 1],
                local: vec![0, 3]
            }
        );
        assert_eq!(
            pieces[3],
            ChunkPiece {
                chunk: vec![1, 1],
                first: vec![1, 1],
                count: vec![1, 4],
                local: vec![0, 0]
            }
        );
        let total: usize = pieces.iter().map(|piece| elements(&piece.count)).sum();
        assert_eq!(total, slab.len());

        let scalar = Hyperslab {
            start: vec![],
            count: vec![],
            stride: vec![],
        };
        assert_eq!(chunk_pieces(&scalar, &[]).len(), 1);
    }
}
