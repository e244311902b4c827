//! Broadcast of the whole output buffer from one local root.
//!
//! Ranks are remapped so the root becomes logical rank 0; the chain and the
//! tree are then laid out over logical ranks.

use crate::error::{HcollError, Result};
use crate::link::LinkRef;
use crate::slice::Slice;
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState};
use crate::types::UserMemType;

fn check_root(a: &PrepareArgs, op: &'static str) -> Result<usize> {
    a.check_group(op)?;
    match a.root {
        Some(root) if root < a.group_size => Ok(root),
        Some(root) => Err(HcollError::param(
            op,
            format!("root {root} outside group of {}", a.group_size),
        )),
        None => Err(HcollError::param(op, "broadcast requires a root")),
    }
}

/// Pipelined chain: the buffer is cut into chunks that flow down the chain
/// `root -> root+1 -> ...`, so later hops overlap earlier ones.
pub struct BroadcastChain {
    core: Core,
}

impl BroadcastChain {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::BroadcastChain),
        }
    }
}

impl Default for BroadcastChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for BroadcastChain {
    fn kind(&self) -> TemplateKind {
        TemplateKind::BroadcastChain
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core
            .prepare(args, |a| check_root(a, "broadcast_chain").map(|_| ()))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        let root = check_root(args, "broadcast_chain")?;
        if n > 1 {
            let logical = (local_rank + n - root) % n;
            let prev = (local_rank + n - 1) % n;
            let next = (local_rank + 1) % n;
            let stream = &args.main_stream;
            let chunks = Slice::new(0, args.mem.output.len())
                .split(args.ctx.config.broadcast_chunks.max(1), args.elem_size());
            for (c, chunk) in chunks.iter().enumerate() {
                let view = args.mem.output.range(chunk.offset, chunk.size)?;
                if logical > 0 {
                    links[prev].rx_async(UserMemType::OutputMem, chunk.offset as u64, &view, stream)?;
                }
                if logical + 1 < n {
                    tracing::trace!(local_rank, chunk = c, "broadcast chain forward");
                    links[next].tx_async(UserMemType::OutputMem, chunk.offset as u64, &view, stream)?;
                }
            }
            if logical > 0 {
                links[prev].rx_wait_done(stream)?;
            }
            if logical + 1 < n {
                links[next].tx_wait_done(stream)?;
            }
        }
        self.core.finish();
        Ok(())
    }
}

/// Binary tree over logical ranks: logical `l` receives from `(l - 1) / 2`
/// and forwards to `2l + 1` and `2l + 2`.
pub struct BroadcastTree {
    core: Core,
}

impl BroadcastTree {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::BroadcastTree),
        }
    }
}

impl Default for BroadcastTree {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for BroadcastTree {
    fn kind(&self) -> TemplateKind {
        TemplateKind::BroadcastTree
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core
            .prepare(args, |a| check_root(a, "broadcast_tree").map(|_| ()))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        let root = check_root(args, "broadcast_tree")?;
        if n > 1 {
            let logical = |r: usize| (r + n - root) % n;
            let physical = |l: usize| (l + root) % n;
            let me = logical(local_rank);
            let stream = &args.main_stream;
            let data = &args.mem.output;
            if me > 0 {
                let parent = physical((me - 1) / 2);
                links[parent].rx_async(UserMemType::OutputMem, 0, data, stream)?;
                links[parent].rx_wait_done(stream)?;
            }
            for child in [2 * me + 1, 2 * me + 2] {
                if child < n {
                    let peer = physical(child);
                    tracing::trace!(local_rank, peer, "broadcast tree send");
                    links[peer].tx_async(UserMemType::OutputMem, 0, data, stream)?;
                    links[peer].tx_wait_done(stream)?;
                }
            }
        }
        self.core.finish();
        Ok(())
    }
}
