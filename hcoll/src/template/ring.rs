//! Ring all-gather and ring reduce-scatter.
//!
//! Both run `n-1` neighbor steps on the main stream: send to `(r+1) mod n`,
//! receive from `(r-1) mod n`. Stream ordering makes each step's send see
//! the previous step's receive.

use crate::error::Result;
use crate::link::LinkRef;
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState, ring_neighbors};
use crate::types::UserMemType;

/// Ring all-gather over the blocks in `slices`.
pub struct AllGatherRing {
    core: Core,
}

impl AllGatherRing {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllGatherRing),
        }
    }
}

impl Default for AllGatherRing {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for AllGatherRing {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllGatherRing
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| a.check_slices("allgather_ring"))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        if n > 1 {
            let (prev, next) = ring_neighbors(local_rank, n);
            let stream = &args.main_stream;
            for step in 0..n - 1 {
                let send_idx = (local_rank + n - step) % n;
                let recv_idx = (local_rank + 2 * n - step - 1) % n;
                let send = args.slices[send_idx];
                let recv = args.slices[recv_idx];
                tracing::trace!(local_rank, step, send_idx, recv_idx, "allgather ring step");
                links[next].tx_async(
                    UserMemType::OutputMem,
                    send.offset as u64,
                    &args.block(send)?,
                    stream,
                )?;
                links[prev].rx_async(
                    UserMemType::OutputMem,
                    recv.offset as u64,
                    &args.block(recv)?,
                    stream,
                )?;
            }
            links[next].tx_wait_done(stream)?;
            links[prev].rx_wait_done(stream)?;
        }
        self.core.finish();
        Ok(())
    }
}

/// Ring reduce-scatter: after the run, block `local_rank` of the output
/// holds the reduction of that block over the group. Receives are staged in
/// scratch.
pub struct ReduceScatterRing {
    core: Core,
}

impl ReduceScatterRing {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::ReduceScatterRing),
        }
    }
}

impl Default for ReduceScatterRing {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for ReduceScatterRing {
    fn kind(&self) -> TemplateKind {
        TemplateKind::ReduceScatterRing
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| {
            a.check_slices("reduce_scatter_ring")?;
            a.reduce_op("reduce_scatter_ring")?;
            if a.group_size > 1 {
                a.mem.scratch_at_least(a.max_slice())?;
            }
            Ok(())
        })
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        if n > 1 {
            let op = args.reduce_op("reduce_scatter_ring")?;
            let scratch = args.mem.scratch()?;
            let dispatcher = &args.ctx.dispatcher;
            let (prev, next) = ring_neighbors(local_rank, n);
            let stream = &args.main_stream;
            for step in 0..n - 1 {
                let send_idx = (local_rank + 2 * n - step - 1) % n;
                let recv_idx = (local_rank + 2 * n - step - 2) % n;
                let send = args.slices[send_idx];
                let recv = args.slices[recv_idx];
                let staging = scratch.range(0, recv.size)?;
                tracing::trace!(local_rank, step, send_idx, recv_idx, "reduce-scatter ring step");
                links[next].tx_async(
                    UserMemType::OutputMem,
                    send.offset as u64,
                    &args.block(send)?,
                    stream,
                )?;
                links[prev].rx_async(UserMemType::ScratchMem, 0, &staging, stream)?;
                dispatcher.reduce_async(stream, &args.block(recv)?, &staging, args.dtype, op)?;
            }
            links[next].tx_wait_done(stream)?;
            links[prev].rx_wait_done(stream)?;
        }
        self.core.finish();
        Ok(())
    }
}
