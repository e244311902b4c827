use crate::error::{HcollError, Result};
use crate::executor::{
    ComputesResourceRequest, DecomposesIntoLevels, LevelRunner, LevelStep, OpContext, ResourceRequest,
    RunsTemplate, aux_need, check_len, rank_blocks, template_for,
};
use crate::memory::{DeviceMem, ExecMem};
use crate::selector::Algorithm;
use crate::slice::Slice;
use crate::template::TemplateKind;
use crate::topology::CommPlane;
use crate::types::OpKind;

/// All-gather: seed the own block, then gather level by level from the
/// innermost group outwards.
pub(crate) struct AllGatherPlan;

impl AllGatherPlan {
    /// A pipeline label at level 1 replaces the whole walk by one striped
    /// run across every rank.
    fn striped(cx: &OpContext<'_>) -> bool {
        cx.shape.level_count() >= 2 && cx.choice.level(1) == Some(Algorithm::Pipeline)
    }
}

impl ComputesResourceRequest for AllGatherPlan {
    fn resource_request(&self, cx: &OpContext<'_>) -> Result<ResourceRequest> {
        let total = cx.world() * cx.desc.block_bytes();
        let mut req = ResourceRequest {
            needs_staging_buffer: cx.desc.is_strided(),
            staging_bytes: if cx.desc.is_strided() { total } else { 0 },
            ..Default::default()
        };
        for step in self.decompose(cx, Slice::new(0, total))? {
            req = req.max(ResourceRequest::aux(aux_need(step.kind, step.group_size, cx.config)));
        }
        Ok(req)
    }
}

impl DecomposesIntoLevels for AllGatherPlan {
    fn decompose(&self, cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
        if cx.world() == 1 {
            return Ok(Vec::new());
        }
        if Self::striped(cx) {
            let planes = cx.config.plane_count();
            let local_hop = cx.shape.group_size(0) - 1;
            let mut link_sets: Vec<(CommPlane, usize)> = (0..planes).map(|p| (CommPlane::Combined, p)).collect();
            if local_hop > 0 {
                link_sets.extend((0..planes).map(|p| (CommPlane::CombinedLocal, p)));
            }
            return Ok(vec![LevelStep {
                level: None,
                kind: TemplateKind::AllGatherStriped,
                plane: CommPlane::Combined,
                local_rank: cx.rank as usize,
                group_size: cx.world(),
                slices: rank_blocks(cx.shape, region, cx.elem_size()),
                root: None,
                local_hop,
                link_sets,
                phase: None,
            }]);
        }
        let part = cx.partition(region);
        let mut steps = Vec::new();
        for lv in &part.levels {
            if lv.group_size() == 1 {
                tracing::debug!(level = lv.level, "single-member level skipped");
                continue;
            }
            let mut alg = cx.choice.level_or_ring(lv.level);
            if alg == Algorithm::Pipeline {
                alg = Algorithm::Ring;
            }
            let kind = template_for(OpKind::AllGather, alg)
                .ok_or_else(|| HcollError::Internal(format!("no all-gather template for {alg}")))?;
            steps.push(LevelStep::at_level(lv, kind));
        }
        Ok(steps)
    }
}

impl RunsTemplate for AllGatherPlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let block = cx.desc.block_bytes();
        let world = cx.world();
        let total = world * block;
        check_len("input", input, block)?;

        let stride_bytes = cx.desc.stride_count as usize * cx.elem_size();
        let work = if cx.desc.is_strided() {
            check_len("output", output, (world - 1) * stride_bytes + block)?;
            runner
                .resources()
                .staging_output
                .as_ref()
                .ok_or(HcollError::MissingBuffer("staging output"))?
                .range(0, total)?
        } else {
            check_len("output", output, total)?;
            output.range(0, total)?
        };

        let region = Slice::new(0, total);
        let own = cx.partition(region).own_block();
        runner.copy(cx, &work.range(own.offset, own.size)?, &input.range(0, block)?)?;

        let mem = ExecMem::new(input.clone(), work.clone());
        for step in self.decompose(cx, region)? {
            runner.run_step(cx, &step, mem.clone())?;
        }

        if cx.desc.is_strided() {
            for (g, b) in rank_blocks(cx.shape, region, cx.elem_size()).into_iter().enumerate() {
                runner.copy(cx, &output.range(g * stride_bytes, b.size)?, &work.range(b.offset, b.size)?)?;
            }
        }
        Ok(())
    }
}
