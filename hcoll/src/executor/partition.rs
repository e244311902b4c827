//! Per-level byte-range partitioning of one logical buffer.
//!
//! The outermost group spans the whole region. Each level splits its group's
//! region into one slice per member; the slice of the member this rank
//! belongs to becomes the region of the next inner level. Levels of size 1
//! contribute a single slice covering their whole region.

use crate::slice::Slice;
use crate::topology::TopologyShape;
use crate::types::Rank;

/// One level's view of the partition, as seen from the current rank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSlices {
    pub level: usize,
    /// Byte range owned by this rank's group at `level`.
    pub region: Slice,
    /// `region` split into one slice per member, by local index.
    pub slices: Vec<Slice>,
    /// This rank's local index at `level`.
    pub local_rank: usize,
}

impl LevelSlices {
    pub fn group_size(&self) -> usize {
        self.slices.len()
    }

    /// The slice owned by this rank's member.
    pub fn own(&self) -> Slice {
        self.slices[self.local_rank]
    }
}

/// Partition of `region` across every level of `shape`, innermost first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelPartition {
    pub levels: Vec<LevelSlices>,
}

impl LevelPartition {
    /// Split `region` for `rank`. Slice sizes are multiples of `align`
    /// except for the last slice of each level.
    pub fn new(shape: &TopologyShape, rank: Rank, region: Slice, align: usize) -> Self {
        let coords = shape.coords(rank);
        let mut levels = Vec::with_capacity(shape.level_count());
        let mut current = region;
        for level in (0..shape.level_count()).rev() {
            let slices = current.split(shape.group_size(level), align);
            let local_rank = coords[level];
            let next = slices[local_rank];
            levels.push(LevelSlices {
                level,
                region: current,
                slices,
                local_rank,
            });
            current = next;
        }
        levels.reverse();
        Self { levels }
    }

    pub fn level(&self, level: usize) -> &LevelSlices {
        &self.levels[level]
    }

    /// Innermost slice owned by this rank alone.
    pub fn own_block(&self) -> Slice {
        self.levels.first().map(LevelSlices::own).unwrap_or_default()
    }
}

/// Innermost block of every global rank, by rank.
pub fn rank_blocks(shape: &TopologyShape, region: Slice, align: usize) -> Vec<Slice> {
    (0..shape.world_size() as Rank)
        .map(|r| LevelPartition::new(shape, r, region, align).own_block())
        .collect()
}
