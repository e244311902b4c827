//! Logarithmic-step all-gather.
//!
//! At step `k` with distance `d = 2^k`, a rank sends every block it holds to
//! `r - d` and receives the next run of blocks from `r + d`. After
//! `ceil(log2 n)` steps each rank holds all `n` blocks. Blocks land directly
//! at their final offsets, so no rotation pass is needed.

use crate::error::Result;
use crate::link::LinkRef;
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState};
use crate::types::UserMemType;

pub struct AllGatherNhr {
    core: Core,
}

impl AllGatherNhr {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllGatherNhr),
        }
    }
}

impl Default for AllGatherNhr {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for AllGatherNhr {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllGatherNhr
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| a.check_slices("allgather_nhr"))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        let r = local_rank;
        let stream = &args.main_stream;
        let mut dist = 1usize;
        let mut step = 0usize;
        while dist < n {
            let run = dist.min(n - dist);
            let to = (r + n - dist) % n;
            let from = (r + dist) % n;
            tracing::trace!(local_rank, step, dist, run, "nhr step");
            for i in 0..run {
                let idx = (r + i) % n;
                let s = args.slices[idx];
                links[to].tx_async(UserMemType::OutputMem, s.offset as u64, &args.block(s)?, stream)?;
            }
            for i in 0..run {
                let idx = (from + i) % n;
                let s = args.slices[idx];
                links[from].rx_async(UserMemType::OutputMem, s.offset as u64, &args.block(s)?, stream)?;
            }
            links[to].tx_wait_done(stream)?;
            links[from].rx_wait_done(stream)?;
            dist *= 2;
            step += 1;
        }
        self.core.finish();
        Ok(())
    }
}
