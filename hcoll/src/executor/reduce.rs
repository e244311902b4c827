use crate::error::{HcollError, Result};
use crate::executor::{
    ComputesResourceRequest, DecomposesIntoLevels, LevelRunner, LevelStep, OpContext, ResourceRequest,
    RunsTemplate, aux_need, check_len, template_for,
};
use crate::memory::{DeviceMem, ExecMem};
use crate::selector::{Algorithm, pipeline_slice_count};
use crate::slice::Slice;
use crate::template::TemplateKind;
use crate::types::OpKind;

/// Reduce-scatter steps over `region`, outermost level first.
fn reduce_scatter_walk(cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
    let part = cx.partition(region);
    let mut steps = Vec::new();
    for lv in part.levels.iter().rev() {
        if lv.group_size() == 1 {
            continue;
        }
        let alg = cx.choice.level_or_ring(lv.level);
        let kind = template_for(OpKind::ReduceScatter, alg)
            .ok_or_else(|| HcollError::Internal(format!("no reduce-scatter template for {alg}")))?;
        steps.push(LevelStep::at_level(lv, kind));
    }
    Ok(steps)
}

/// All-gather steps over `region`, innermost level first.
fn allgather_walk(cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
    let part = cx.partition(region);
    let mut steps = Vec::new();
    for lv in &part.levels {
        if lv.group_size() == 1 {
            continue;
        }
        let alg = cx.choice.level_or_ring(lv.level);
        let kind = template_for(OpKind::AllReduce, alg)
            .ok_or_else(|| HcollError::Internal(format!("no all-gather template for {alg}")))?;
        steps.push(LevelStep::at_level(lv, kind));
    }
    Ok(steps)
}

/// Receive staging a reduce-scatter step needs in scratch.
fn staging_need(step: &LevelStep) -> usize {
    match step.kind {
        TemplateKind::ReduceScatterMesh => {
            step.group_size.saturating_sub(1) * step.slices.get(step.local_rank).map_or(0, |s| s.size)
        }
        TemplateKind::ReduceScatterRing => step.slices.iter().map(|s| s.size).max().unwrap_or(0),
        _ => 0,
    }
}

fn aux_request(cx: &OpContext<'_>, steps: &[LevelStep]) -> ResourceRequest {
    steps.iter().fold(ResourceRequest::default(), |req, s| {
        req.max(ResourceRequest::aux(aux_need(s.kind, s.group_size, cx.config)))
    })
}

/// Reduce-scatter over a working copy of the input. Each level reduces the
/// region of the rank's group into the rank's share of it; the innermost
/// share is the result.
///
/// Scratch layout: `[0, total)` working copy, the rest receive staging
/// (`total` bytes unless an uneven mesh level needs more).
pub(crate) struct ReduceScatterPlan;

impl ComputesResourceRequest for ReduceScatterPlan {
    fn resource_request(&self, cx: &OpContext<'_>) -> Result<ResourceRequest> {
        let total = cx.world() * cx.desc.block_bytes();
        let steps = self.decompose(cx, Slice::new(0, total))?;
        let staging = steps.iter().map(staging_need).max().unwrap_or(0).max(total);
        Ok(ResourceRequest {
            scratch_bytes: total + staging,
            ..aux_request(cx, &steps)
        })
    }
}

impl DecomposesIntoLevels for ReduceScatterPlan {
    fn decompose(&self, cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
        reduce_scatter_walk(cx, region)
    }
}

impl RunsTemplate for ReduceScatterPlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let block = cx.desc.block_bytes();
        let total = cx.world() * block;
        check_len("input", input, total)?;
        check_len("output", output, block)?;
        let scratch = runner
            .resources()
            .scratch
            .as_ref()
            .ok_or(HcollError::MissingBuffer("scratch"))?;
        let work = scratch.range(0, total)?;
        let staging = scratch.range(total, scratch.len().saturating_sub(total))?;

        runner.copy(cx, &work, &input.range(0, total)?)?;
        let region = Slice::new(0, total);
        let mem = ExecMem::new(input.clone(), work.clone()).with_scratch(staging);
        for step in self.decompose(cx, region)? {
            runner.run_step(cx, &step, mem.clone())?;
        }
        let own = cx.partition(region).own_block();
        runner.copy(cx, &output.range(0, block)?, &work.range(own.offset, own.size)?)
    }
}

/// All-reduce in place on the output: a reduce-scatter walk followed by an
/// all-gather walk over the same partition. Large payloads are cut into
/// sequential slices that each run both walks.
pub(crate) struct AllReducePlan;

impl AllReducePlan {
    /// Sequential slices of the `total`-byte buffer.
    fn chunks(cx: &OpContext<'_>, total: usize) -> Vec<Slice> {
        let inter_ring = cx.choice.level_or_ring(1) == Algorithm::Ring;
        let n = pipeline_slice_count(
            OpKind::AllReduce,
            total as u64,
            cx.shape.group_size(0),
            cx.shape.group_size(1),
            inter_ring,
        )
        .max(1) as usize;
        if n > 1 {
            tracing::debug!(slices = n, bytes = total, "all-reduce split into pipeline slices");
        }
        Slice::new(0, total)
            .split(n, cx.elem_size())
            .into_iter()
            .filter(|s| !s.is_empty())
            .collect()
    }
}

impl ComputesResourceRequest for AllReducePlan {
    fn resource_request(&self, cx: &OpContext<'_>) -> Result<ResourceRequest> {
        let total = cx.desc.block_bytes();
        let mut steps = Vec::new();
        for chunk in Self::chunks(cx, total) {
            steps.extend(self.decompose(cx, chunk)?);
        }
        let staging = steps.iter().map(staging_need).max().unwrap_or(0).max(total);
        Ok(ResourceRequest {
            scratch_bytes: staging,
            ..aux_request(cx, &steps)
        })
    }
}

impl DecomposesIntoLevels for AllReducePlan {
    fn decompose(&self, cx: &OpContext<'_>, region: Slice) -> Result<Vec<LevelStep>> {
        let mut steps = reduce_scatter_walk(cx, region)?;
        steps.extend(allgather_walk(cx, region)?);
        Ok(steps)
    }
}

impl RunsTemplate for AllReducePlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let total = cx.desc.block_bytes();
        check_len("input", input, total)?;
        check_len("output", output, total)?;
        let scratch = runner
            .resources()
            .scratch
            .as_ref()
            .ok_or(HcollError::MissingBuffer("scratch"))?;
        let work = output.range(0, total)?;
        let src = input.range(0, total)?;
        if !(src.same_allocation(&work) && src.offset() == work.offset()) {
            runner.copy(cx, &work, &src)?;
        }
        let mem = ExecMem::new(src, work).with_scratch(scratch.clone());
        for chunk in Self::chunks(cx, total) {
            for step in self.decompose(cx, chunk)? {
                runner.run_step(cx, &step, mem.clone())?;
            }
        }
        Ok(())
    }
}
