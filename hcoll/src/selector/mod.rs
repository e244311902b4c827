//! Topology-aware algorithm selection.
//!
//! For every level above the innermost the selector evaluates closed-form
//! cost models and picks the cheapest pattern. Level 1 may additionally be
//! promoted to the striped pipeline when the payload is large enough and the
//! schedule fits the platform context budget.

mod choice;
pub mod cost;

pub use choice::{Algorithm, AlgorithmChoice, LEVEL_ALGO_WIDTH, MAX_LEVELS};
pub use cost::{CostInput, CostModel, Costs, pipeline_context_estimate, pipeline_slice_count};

use crate::config::HcollConfig;
use crate::error::{HcollError, Result};
use crate::topology::TopologyShape;
use crate::types::OpKind;

/// Level at which the striped pipeline can be selected.
const PIPELINE_LEVEL: usize = 1;

/// Picks one [`Algorithm`] per topology level. Pure function of its inputs.
#[derive(Debug, Clone, Default)]
pub struct AlgorithmSelector {
    config: HcollConfig,
}

impl AlgorithmSelector {
    pub fn new(config: HcollConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &HcollConfig {
        &self.config
    }

    /// Choose the per-level algorithms for an operation of `size_bytes` per
    /// rank on `shape`.
    ///
    /// `inline_reduce` and `rdma_reduce` state whether the transport can
    /// reduce in flight; the pipelined reduce paths need both.
    pub fn select(
        &self,
        op: OpKind,
        size_bytes: u64,
        shape: &TopologyShape,
        inline_reduce: bool,
        rdma_reduce: bool,
    ) -> Result<AlgorithmChoice> {
        let model = CostModel::for_op(op).ok_or(HcollError::NoCostModel(op))?;

        let level0 = if shape.level0_mesh {
            Algorithm::Mesh
        } else {
            Algorithm::Ring
        };
        let mut choice = AlgorithmChoice::empty().with_level(0, level0)?;

        if shape.is_single_group() {
            for level in 1..shape.level_count().min(MAX_LEVELS) {
                choice = choice.with_level(level, Algorithm::Ring)?;
            }
            tracing::debug!(%op, size_bytes, %choice, "single group, default algorithms");
            return Ok(choice);
        }

        let bytes = size_bytes.min(self.config.ccl_buffer_bytes);
        let inner_size = shape.group_size(0);
        for level in 1..shape.level_count().min(MAX_LEVELS) {
            let input = CostInput {
                group_size: shape.group_size(level),
                bytes,
                world: shape.world_size(),
                inner_size,
                latency_us: self.config.latency_us,
                bandwidth_bps: self.config.bandwidth_gbps(level) * cost::GB2B,
            };
            let costs = model.costs(&input);
            let mut alg = costs.pick();
            if level == PIPELINE_LEVEL
                && self.pipeline_eligible(op, size_bytes, shape, inline_reduce, rdma_reduce)
            {
                alg = Algorithm::Pipeline;
            }
            tracing::debug!(
                %op,
                level,
                group_size = input.group_size,
                ring = costs.ring,
                nhr = ?costs.nhr,
                hd = costs.hd,
                %alg,
                "level algorithm selected"
            );
            choice = choice.with_level(level, alg)?;
        }
        Ok(choice)
    }

    /// Whether level 1 may run the striped pipeline.
    pub fn pipeline_eligible(
        &self,
        op: OpKind,
        size_bytes: u64,
        shape: &TopologyShape,
        inline_reduce: bool,
        rdma_reduce: bool,
    ) -> bool {
        let n0 = shape.group_size(0);
        let n1 = shape.group_size(PIPELINE_LEVEL);
        if n0 == 1 || !shape.level0_mesh {
            return false;
        }
        let contexts = pipeline_context_estimate(op, n0, n1);
        if contexts > self.config.context_budget {
            tracing::debug!(%op, contexts, budget = self.config.context_budget, "pipeline exceeds context budget");
            return false;
        }

        let cfg = &self.config;
        let reduce_ok = !cfg.deterministic && inline_reduce && rdma_reduce;
        match op {
            OpKind::AllGather => {
                let threshold = if cfg.rdma_lite {
                    cfg.pipeline_min_bytes_lite
                } else {
                    cfg.pipeline_min_bytes
                };
                size_bytes >= threshold
            }
            OpKind::ReduceScatter => {
                let threshold = if cfg.rdma_lite {
                    cfg.pipeline_min_bytes_lite
                } else {
                    cfg.pipeline_min_bytes
                };
                reduce_ok && size_bytes >= threshold
            }
            OpKind::AllReduce => {
                let threshold = if cfg.rdma_lite {
                    cfg.pipeline_allreduce_min_bytes_lite
                } else {
                    cfg.pipeline_min_bytes
                };
                let per_hop = size_bytes / (n1 * n0) as u64;
                reduce_ok && per_hop >= threshold
            }
            OpKind::Broadcast | OpKind::AllToAll | OpKind::SendRecv => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_single_group_returns_default() {
        let sel = AlgorithmSelector::default();
        let c = sel
            .select(OpKind::AllGather, 64 * MIB, &TopologyShape::new([8]).with_mesh(), true, true)
            .unwrap();
        assert_eq!(c.level(0), Some(Algorithm::Mesh));
        assert_eq!(c.level(1), None);

        let c = sel
            .select(OpKind::AllReduce, 64 * MIB, &TopologyShape::new([8, 1]), true, true)
            .unwrap();
        assert_eq!(c.level(0), Some(Algorithm::Ring));
        assert_eq!(c.level(1), Some(Algorithm::Ring));
    }

    #[test]
    fn test_no_cost_model() {
        let sel = AlgorithmSelector::default();
        let err = sel
            .select(OpKind::AllToAll, 1024, &TopologyShape::new([8]), true, true)
            .unwrap_err();
        assert!(matches!(err, HcollError::NoCostModel(OpKind::AllToAll)));
        assert!(err.is_parameter_error());
    }

    #[test]
    fn test_selection_is_deterministic() {
        let sel = AlgorithmSelector::default();
        for n in [1usize, 2, 3, 5, 8, 17] {
            for op in [
                OpKind::AllGather,
                OpKind::ReduceScatter,
                OpKind::AllReduce,
                OpKind::Broadcast,
            ] {
                for size in [1u64, 4096, 64 * MIB] {
                    let shape = TopologyShape::new([4, n]);
                    let a = sel.select(op, size, &shape, false, false).unwrap();
                    let b = sel.select(op, size, &shape, false, false).unwrap();
                    assert_eq!(a, b, "op {op} n {n} size {size}");
                    assert!(a.level(1).is_some());
                }
            }
        }
    }

    #[test]
    fn test_pair_of_nodes_prefers_ring() {
        let sel = AlgorithmSelector::default();
        let c = sel
            .select(OpKind::AllGather, 4096, &TopologyShape::new([4, 2]), false, false)
            .unwrap();
        assert_eq!(c.level(1), Some(Algorithm::Ring));
    }

    #[test]
    fn test_pipeline_selected_for_large_allgather() {
        let sel = AlgorithmSelector::default();
        let shape = TopologyShape::new([8, 4]).with_mesh();
        let c = sel.select(OpKind::AllGather, 32 * 1024, &shape, false, false).unwrap();
        assert_eq!(c.level(0), Some(Algorithm::Mesh));
        assert_eq!(c.level(1), Some(Algorithm::Pipeline));
        let c = sel.select(OpKind::AllGather, 32 * 1024 - 1, &shape, false, false).unwrap();
        assert_ne!(c.level(1), Some(Algorithm::Pipeline));
    }

    #[test]
    fn test_pipeline_requires_mesh_and_budget() {
        let shape = TopologyShape::new([8, 4]);
        let sel = AlgorithmSelector::default();
        assert!(!sel.pipeline_eligible(OpKind::AllGather, 64 * MIB, &shape, true, true));

        let sel = AlgorithmSelector::new(HcollConfig {
            context_budget: 100,
            ..Default::default()
        });
        let mesh = shape.with_mesh();
        assert!(!sel.pipeline_eligible(OpKind::AllGather, 64 * MIB, &mesh, true, true));
    }

    #[test]
    fn test_pipeline_reduce_conditions() {
        let shape = TopologyShape::new([8, 4]).with_mesh();
        let sel = AlgorithmSelector::default();
        assert!(sel.pipeline_eligible(OpKind::ReduceScatter, MIB, &shape, true, true));
        assert!(!sel.pipeline_eligible(OpKind::ReduceScatter, MIB, &shape, true, false));

        let det = AlgorithmSelector::new(HcollConfig {
            deterministic: true,
            ..Default::default()
        });
        assert!(!det.pipeline_eligible(OpKind::ReduceScatter, MIB, &shape, true, true));
    }

    #[test]
    fn test_allreduce_threshold_is_per_hop() {
        let shape = TopologyShape::new([8, 4]).with_mesh();
        let sel = AlgorithmSelector::default();
        assert!(sel.pipeline_eligible(OpKind::AllReduce, 32 * MIB, &shape, true, true));
        assert!(!sel.pipeline_eligible(OpKind::AllReduce, 32 * MIB - 1, &shape, true, true));

        let no_lite = AlgorithmSelector::new(HcollConfig {
            rdma_lite: false,
            ..Default::default()
        });
        assert!(!no_lite.pipeline_eligible(OpKind::AllReduce, 32 * MIB, &shape, true, true));
        assert!(no_lite.pipeline_eligible(OpKind::AllReduce, 64 * MIB, &shape, true, true));
    }

    #[test]
    fn test_broadcast_never_pipelines() {
        let sel = AlgorithmSelector::default();
        let shape = TopologyShape::new([8, 4]).with_mesh();
        let c = sel.select(OpKind::Broadcast, 64 * MIB, &shape, true, true).unwrap();
        assert_ne!(c.level(1), Some(Algorithm::Pipeline));
        assert_ne!(c.level(1), Some(Algorithm::Nhr));
    }

    #[test]
    fn test_three_levels_labelled() {
        let sel = AlgorithmSelector::default();
        let c = sel
            .select(OpKind::ReduceScatter, MIB, &TopologyShape::new([4, 4, 8]), false, false)
            .unwrap();
        assert!(c.level(1).is_some());
        assert!(c.level(2).is_some());
        assert_ne!(c.level(1), Some(Algorithm::Pipeline));
    }
}
