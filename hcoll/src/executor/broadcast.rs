use crate::error::{HcollError, Result};
use crate::executor::{
    ComputesResourceRequest, DecomposesIntoLevels, LevelRunner, LevelStep, OpContext, ResourceRequest,
    RunsTemplate, check_len, template_for,
};
use crate::memory::{DeviceMem, ExecMem};
use crate::slice::Slice;
use crate::topology::CommPlane;
use crate::types::OpKind;

/// Broadcast from the outermost level inwards. At level `k` only the ranks
/// that share the root's coordinates on every inner level take part, with
/// the root's level-`k` coordinate as local root.
pub(crate) struct BroadcastPlan;

impl BroadcastPlan {
    fn root_coords(cx: &OpContext<'_>) -> Result<Vec<usize>> {
        let root = cx
            .desc
            .root
            .ok_or_else(|| HcollError::param("broadcast", "broadcast requires a root"))?;
        Ok(cx.shape.coords(root))
    }
}

impl ComputesResourceRequest for BroadcastPlan {
    fn resource_request(&self, _cx: &OpContext<'_>) -> Result<ResourceRequest> {
        Ok(ResourceRequest::default())
    }
}

impl DecomposesIntoLevels for BroadcastPlan {
    fn decompose(&self, cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
        let root = Self::root_coords(cx)?;
        let me = cx.shape.coords(cx.rank);
        let mut steps = Vec::new();
        for level in (0..cx.shape.level_count()).rev() {
            let n = cx.shape.group_size(level);
            if n == 1 || me[..level] != root[..level] {
                continue;
            }
            let alg = cx.choice.level_or_ring(level);
            let kind = template_for(OpKind::Broadcast, alg)
                .ok_or_else(|| HcollError::Internal(format!("no broadcast template for {alg}")))?;
            steps.push(LevelStep {
                level: Some(level),
                kind,
                plane: CommPlane::Level(level),
                local_rank: me[level],
                group_size: n,
                slices: vec![region],
                root: Some(root[level]),
                local_hop: 0,
                link_sets: Vec::new(),
                phase: None,
            });
        }
        Ok(steps)
    }
}

impl RunsTemplate for BroadcastPlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let total = cx.desc.block_bytes();
        check_len("output", output, total)?;
        let work = output.range(0, total)?;
        if cx.desc.root == Some(cx.rank) && !input.is_empty() {
            check_len("input", input, total)?;
            let src = input.range(0, total)?;
            if !(src.same_allocation(&work) && src.offset() == work.offset()) {
                runner.copy(cx, &work, &src)?;
            }
        }
        let mem = ExecMem::new(input.clone(), work);
        for step in self.decompose(cx, Slice::new(0, total))? {
            runner.run_step(cx, &step, mem.clone())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HcollConfig;
    use crate::executor::OperationDescriptor;
    use crate::selector::{Algorithm, AlgorithmChoice};
    use crate::stream::Stream;
    use crate::template::TemplateKind;
    use crate::topology::TopologyShape;
    use crate::types::{DataType, Rank};

    fn steps(rank: Rank, root: Rank) -> Vec<LevelStep> {
        let shape = TopologyShape::new([4, 3]);
        let config = HcollConfig::default();
        let desc = OperationDescriptor::new(OpKind::Broadcast, 8, DataType::F32, Stream::new(0).unwrap())
            .with_root(root);
        let cx = OpContext {
            desc: &desc,
            choice: AlgorithmChoice::from_levels(&[Algorithm::Ring, Algorithm::HalvingDoubling]).unwrap(),
            shape: &shape,
            rank,
            config: &config,
        };
        BroadcastPlan.decompose(&cx, Slice::new(0, 32)).unwrap()
    }

    #[tokio::test]
    async fn test_root_column_crosses_levels_first() {
        // root 6 = (2, 1); rank 10 = (2, 2) shares the inner coordinate
        let s = steps(10, 6);
        assert_eq!(s.len(), 2);
        assert_eq!(s[0].level, Some(1));
        assert_eq!(s[0].kind, TemplateKind::BroadcastTree);
        assert_eq!((s[0].local_rank, s[0].root), (2, Some(1)));
        assert_eq!(s[1].level, Some(0));
        assert_eq!(s[1].kind, TemplateKind::BroadcastChain);
        assert_eq!((s[1].local_rank, s[1].root), (2, Some(2)));
    }

    #[tokio::test]
    async fn test_off_column_ranks_wait_for_inner_level() {
        // rank 1 = (1, 0) only joins the level-0 broadcast of its group
        let s = steps(1, 6);
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].level, Some(0));
        assert_eq!(s[0].root, Some(2));
    }
}
