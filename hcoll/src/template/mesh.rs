//! Full-mesh all-gather and reduce-scatter.
//!
//! Every peer is handled on its own auxiliary stream between a fan-out and a
//! fan-in barrier, so the `n - 1` exchanges proceed concurrently.

use crate::error::Result;
use crate::link::LinkRef;
use crate::sync::{finish_aux, start_aux};
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState};
use crate::types::UserMemType;

pub struct AllGatherMesh {
    core: Core,
}

impl AllGatherMesh {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllGatherMesh),
        }
    }
}

impl Default for AllGatherMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for AllGatherMesh {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllGatherMesh
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| {
            a.check_slices("allgather_mesh")?;
            a.check_aux(a.group_size - 1)
        })
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        if n > 1 {
            let d = args.ctx.dispatcher.as_ref();
            let aux = &args.aux_streams[..n - 1];
            start_aux(d, &args.main_stream, aux, &args.signals.main_to_aux[..n - 1])?;
            let own = args.slices[local_rank];
            let own_block = args.block(own)?;
            for (i, stream) in aux.iter().enumerate() {
                let peer = (local_rank + i + 1) % n;
                let theirs = args.slices[peer];
                tracing::trace!(local_rank, peer, "allgather mesh exchange");
                links[peer].tx_async(UserMemType::OutputMem, own.offset as u64, &own_block, stream)?;
                links[peer].rx_async(
                    UserMemType::OutputMem,
                    theirs.offset as u64,
                    &args.block(theirs)?,
                    stream,
                )?;
                links[peer].tx_wait_done(stream)?;
                links[peer].rx_wait_done(stream)?;
            }
            finish_aux(d, &args.main_stream, aux, &args.signals.aux_to_main[..n - 1])?;
        }
        self.core.finish();
        Ok(())
    }
}

/// Full-mesh reduce-scatter. Peer `i`'s contribution to the own block is
/// staged in scratch window `i` and reduced on that peer's stream.
pub struct ReduceScatterMesh {
    core: Core,
}

impl ReduceScatterMesh {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::ReduceScatterMesh),
        }
    }
}

impl Default for ReduceScatterMesh {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for ReduceScatterMesh {
    fn kind(&self) -> TemplateKind {
        TemplateKind::ReduceScatterMesh
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| {
            a.check_slices("reduce_scatter_mesh")?;
            a.reduce_op("reduce_scatter_mesh")?;
            let n = a.group_size;
            if n > 1 {
                a.check_aux(n - 1)?;
                a.mem
                    .scratch_at_least((n - 1) * a.slices[a.local_rank].size)?;
            }
            Ok(())
        })
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        if n > 1 {
            let op = args.reduce_op("reduce_scatter_mesh")?;
            let d = args.ctx.dispatcher.as_ref();
            let scratch = args.mem.scratch()?;
            let aux = &args.aux_streams[..n - 1];
            let own = args.slices[local_rank];
            let own_block = args.block(own)?;
            start_aux(d, &args.main_stream, aux, &args.signals.main_to_aux[..n - 1])?;
            for (i, stream) in aux.iter().enumerate() {
                let peer = (local_rank + i + 1) % n;
                let theirs = args.slices[peer];
                let staging = scratch.range(i * own.size, own.size)?;
                tracing::trace!(local_rank, peer, "reduce-scatter mesh exchange");
                links[peer].tx_async(
                    UserMemType::OutputMem,
                    theirs.offset as u64,
                    &args.block(theirs)?,
                    stream,
                )?;
                links[peer].rx_async(UserMemType::ScratchMem, (i * own.size) as u64, &staging, stream)?;
                d.reduce_async(stream, &own_block, &staging, args.dtype, op)?;
            }
            finish_aux(d, &args.main_stream, aux, &args.signals.aux_to_main[..n - 1])?;
        }
        self.core.finish();
        Ok(())
    }
}
