//! Partitioning of the row range into contiguous, evenly sized work chunks.

use crate::iter::RowWeightedIterator;
use crate::run::ConfigurationError;
use std::ops::Range;

/// Chunk count used when the caller does not choose one.
pub const DEFAULT_CHUNK_COUNT: usize = 100;

/// One unit of parallel work. Its rows are materialized only when iterated.
#[derive(Debug, Clone)]
pub struct Chunk<'a> {
    /// Position of the chunk in the plan; used to restore row order.
    pub index: usize,
    pub start_index: usize,
    pub end_index: usize,
    pub rows: RowWeightedIterator<'a>,
}

impl Chunk<'_> {
    pub fn len(&self) -> usize {
        self.end_index - self.start_index
    }

    pub fn is_empty(&self) -> bool {
        self.start_index == self.end_index
    }
}

/// Splits `[0, n)` into `min(k, n)` contiguous ranges whose sizes differ by at
/// most one. The first `n % k` ranges carry the extra row.
pub fn plan_ranges(n: usize, k: usize) -> Vec<Range<usize>> {
    let count = k.min(n);
    if count == 0 {
        return Vec::new();
    }
    let base = n / count;
    let extra = n % count;
    let mut ranges = Vec::with_capacity(count);
    let mut start = 0;
    for i in 0..count {
        let size = base + usize::from(i < extra);
        ranges.push(start..start + size);
        start += size;
    }
    ranges
}

/// Plans chunks over the rows of a [`RowWeightedIterator`].
#[derive(Debug, Clone)]
pub struct ChunkPlanner<'a> {
    source: RowWeightedIterator<'a>,
    ranges: Vec<Range<usize>>,
}

impl<'a> ChunkPlanner<'a> {
    pub fn new(source: RowWeightedIterator<'a>, target_chunks: usize) -> Result<Self, ConfigurationError> {
        if target_chunks == 0 {
            return Err(ConfigurationError::InvalidChunkCount);
        }
        let offset = source.range().start;
        let ranges = plan_ranges(source.len(), target_chunks)
            .into_iter()
            .map(|r| r.start + offset..r.end + offset)
            .collect();
        Ok(Self { source, ranges })
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// The planned chunks, in row order.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk<'a>> + '_ {
        self.ranges.iter().enumerate().map(|(index, range)| Chunk {
            index,
            start_index: range.start,
            end_index: range.end,
            rows: self.source.restrict(range.clone()),
        })
    }
}
