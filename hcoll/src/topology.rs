//! Hierarchical topology: level shapes, sub-groups and their links.
//!
//! Levels are ordered innermost first (intra-node, inter-node,
//! inter-superpod). Level-0 groups are runs of consecutive global ranks, so
//! `rank = l0 + n0 * (l1 + n1 * l2)`.

use crate::error::{HcollError, Result};
use crate::link::{LinkRef, LinkType};
use crate::transport::LocalFabric;
use crate::types::Rank;

/// Group size of every topology level, innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyShape {
    level_sizes: Vec<usize>,
    /// Level-0 groups are fully connected.
    pub level0_mesh: bool,
}

impl TopologyShape {
    /// Shape with the given level sizes (zero sizes are clamped to 1).
    pub fn new(level_sizes: impl Into<Vec<usize>>) -> Self {
        let mut level_sizes: Vec<usize> = level_sizes.into();
        for n in &mut level_sizes {
            *n = (*n).max(1);
        }
        if level_sizes.is_empty() {
            level_sizes.push(1);
        }
        Self {
            level_sizes,
            level0_mesh: false,
        }
    }

    /// Mark level 0 as a full mesh.
    pub fn with_mesh(mut self) -> Self {
        self.level0_mesh = true;
        self
    }

    pub fn level_count(&self) -> usize {
        self.level_sizes.len()
    }

    pub fn level_sizes(&self) -> &[usize] {
        &self.level_sizes
    }

    /// Group size at `level`; 1 past the outermost level.
    pub fn group_size(&self, level: usize) -> usize {
        self.level_sizes.get(level).copied().unwrap_or(1)
    }

    pub fn world_size(&self) -> usize {
        self.level_sizes.iter().product()
    }

    /// True when only one level has more than one member.
    pub fn is_single_group(&self) -> bool {
        self.level_sizes.iter().filter(|&&n| n > 1).count() <= 1
    }

    /// Per-level local index of `rank`.
    pub fn coords(&self, rank: Rank) -> Vec<usize> {
        let mut rest = rank as usize;
        self.level_sizes
            .iter()
            .map(|&n| {
                let c = rest % n;
                rest /= n;
                c
            })
            .collect()
    }

    /// Global rank from per-level coordinates.
    pub fn rank_of(&self, coords: &[usize]) -> Rank {
        let mut rank = 0usize;
        for (level, &n) in self.level_sizes.iter().enumerate().rev() {
            rank = rank * n + coords.get(level).copied().unwrap_or(0);
        }
        rank as Rank
    }

    /// Members of `rank`'s group at `level`, ordered by local index.
    pub fn level_members(&self, rank: Rank, level: usize) -> Vec<Rank> {
        let mut coords = self.coords(rank);
        (0..self.group_size(level))
            .map(|i| {
                if let Some(c) = coords.get_mut(level) {
                    *c = i;
                }
                self.rank_of(&coords)
            })
            .collect()
    }

    pub fn validate_rank(&self, rank: Rank) -> Result<()> {
        if rank as usize >= self.world_size() {
            return Err(HcollError::param(
                "topology",
                format!("rank {rank} outside world of {}", self.world_size()),
            ));
        }
        Ok(())
    }
}

/// Which communicator a sub-group is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommPlane {
    /// This rank's group at a hierarchy level.
    Level(usize),
    /// Every rank, over plane-specific links.
    Combined,
    /// Every rank, over node-local-class links.
    CombinedLocal,
}

/// One sub-group as seen from the current rank.
#[derive(Clone)]
pub struct SubGroup {
    pub local_rank: usize,
    pub group_size: usize,
    /// Indexed by local rank; the own entry is a loopback link.
    pub links: Vec<LinkRef>,
}

impl SubGroup {
    pub fn link(&self, local: usize) -> Result<&LinkRef> {
        self.links.get(local).ok_or_else(|| {
            HcollError::param(
                "sub_group",
                format!("no link to local rank {local} in group of {}", self.group_size),
            )
        })
    }
}

impl std::fmt::Debug for SubGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubGroup")
            .field("local_rank", &self.local_rank)
            .field("group_size", &self.group_size)
            .finish()
    }
}

/// Topology query consumed by the executor.
pub trait Topology: Send + Sync {
    fn rank(&self) -> Rank;

    fn shape(&self) -> &TopologyShape;

    /// Sub-group `index` (a parallel link set, e.g. one per plane) of `plane`.
    fn sub_group(&self, plane: CommPlane, index: usize) -> Result<SubGroup>;

    /// Whether `plane` offers at least `min_sets` parallel link sets, i.e.
    /// `sub_group(plane, index)` succeeds for every `index < min_sets`.
    /// Group membership is fixed by [`TopologyShape::group_size`].
    fn check_link_sets(&self, plane: CommPlane, min_sets: usize) -> bool;
}

/// Topology over an in-process [`LocalFabric`].
pub struct StaticTopology {
    rank: Rank,
    shape: TopologyShape,
    fabric: LocalFabric,
    planes: usize,
}

impl StaticTopology {
    /// `planes` parallel link sets are offered on every communicator.
    pub fn new(rank: Rank, shape: TopologyShape, fabric: LocalFabric, planes: usize) -> Result<Self> {
        shape.validate_rank(rank)?;
        Ok(Self {
            rank,
            shape,
            fabric,
            planes: planes.max(1),
        })
    }

    fn link_type(&self, plane: CommPlane, index: usize) -> LinkType {
        match plane {
            CommPlane::Level(0) => LinkType::Fabric,
            CommPlane::Level(_) => LinkType::Rdma,
            CommPlane::CombinedLocal => LinkType::Local,
            // Last plane rides the scale-out network.
            CommPlane::Combined if index + 1 == self.planes && self.planes > 1 => LinkType::Rdma,
            CommPlane::Combined => LinkType::Fabric,
        }
    }
}

impl Topology for StaticTopology {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn shape(&self) -> &TopologyShape {
        &self.shape
    }

    fn sub_group(&self, plane: CommPlane, index: usize) -> Result<SubGroup> {
        if index >= self.planes {
            return Err(HcollError::param(
                "sub_group",
                format!("index {index} exceeds {} parallel groups", self.planes),
            ));
        }
        let (members, local_rank) = match plane {
            CommPlane::Level(level) => {
                if level >= self.shape.level_count() {
                    return Err(HcollError::param(
                        "sub_group",
                        format!("level {level} outside {}-level topology", self.shape.level_count()),
                    ));
                }
                let local = self.shape.coords(self.rank)[level];
                (self.shape.level_members(self.rank, level), local)
            }
            CommPlane::Combined | CommPlane::CombinedLocal => (
                (0..self.shape.world_size() as Rank).collect::<Vec<_>>(),
                self.rank as usize,
            ),
        };
        let link_type = self.link_type(plane, index);
        let links = members
            .iter()
            .map(|&peer| self.fabric.link(plane, index, self.rank, peer, link_type))
            .collect();
        Ok(SubGroup {
            local_rank,
            group_size: members.len(),
            links,
        })
    }

    fn check_link_sets(&self, plane: CommPlane, min_sets: usize) -> bool {
        match plane {
            CommPlane::Level(level) if level >= self.shape.level_count() => false,
            _ => self.planes >= min_sets,
        }
    }
}
