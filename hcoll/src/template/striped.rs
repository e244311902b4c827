//! Striped multi-plane all-gather.
//!
//! Every rank's block is split across `K` planes (bandwidth-weighted or
//! equal). Each plane runs its own ring all-gather on its own auxiliary
//! stream. The first `local_hop` ring steps travel over node-local link sets
//! and the rest over the plane's remote link set.
//!
//! `sub_groups[p]` is plane `p`'s remote link set and, when `local_hop > 0`,
//! `sub_groups[K + p]` is its node-local link set.

use crate::error::{HcollError, Result};
use crate::link::{LinkRef, execute_barrier};
use crate::slice::Slice;
use crate::sync::{finish_aux, start_aux};
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState, ring_neighbors};
use crate::types::UserMemType;

pub struct AllGatherStriped {
    core: Core,
    /// `parts[block][plane]`.
    parts: Vec<Vec<Slice>>,
}

impl AllGatherStriped {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllGatherStriped),
            parts: Vec::new(),
        }
    }

    /// Per-plane byte shares of every block.
    pub fn plane_parts(&self) -> &[Vec<Slice>] {
        &self.parts
    }
}

impl Default for AllGatherStriped {
    fn default() -> Self {
        Self::new()
    }
}

fn check(a: &PrepareArgs) -> Result<Vec<Vec<Slice>>> {
    a.check_slices("allgather_striped")?;
    let cfg = &a.ctx.config;
    let planes = cfg.plane_count();
    if planes == 0 {
        return Err(HcollError::param("allgather_striped", "plane split names no planes"));
    }
    let align = cfg.plane_align_bytes.max(a.elem_size());
    let parts = a
        .slices
        .iter()
        .map(|&s| cfg.plane_split.partition(s, align))
        .collect::<Result<Vec<_>>>()?;
    if a.group_size == 1 {
        return Ok(parts);
    }

    a.check_aux(planes)?;
    let needed = if a.topo.local_hop > 0 { 2 * planes } else { planes };
    if a.sub_groups.len() < needed {
        return Err(HcollError::param(
            "allgather_striped",
            format!("{} link sets for {planes} planes, need {needed}", a.sub_groups.len()),
        ));
    }
    if let Some(g) = a.sub_groups[..needed]
        .iter()
        .find(|g| g.group_size != a.group_size || g.local_rank != a.local_rank || g.links.len() != a.group_size)
    {
        return Err(HcollError::param(
            "allgather_striped",
            format!(
                "plane group {}/{} does not match {}/{}",
                g.local_rank, g.group_size, a.local_rank, a.group_size
            ),
        ));
    }
    Ok(parts)
}

impl AlgTemplate for AllGatherStriped {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllGatherStriped
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        let mut parts = Vec::new();
        self.core.prepare(args, |a| {
            parts = check(a)?;
            Ok(())
        })?;
        self.parts = parts;
        Ok(())
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        if n == 1 {
            self.core.finish();
            return Ok(());
        }

        let cfg = &args.ctx.config;
        let planes = cfg.plane_count();
        let sub_slices = cfg.pipeline_sub_slices.max(1);
        let elem = args.elem_size();
        let local_hop = args.topo.local_hop;
        let (prev, next) = ring_neighbors(local_rank, n);
        let d = args.ctx.dispatcher.as_ref();
        let main = &args.main_stream;
        let aux = &args.aux_streams[..planes];

        // Planes only start once both ring neighbors have reached this point.
        execute_barrier(links[prev].as_ref(), links[next].as_ref(), main)?;
        start_aux(d, main, aux, &args.signals.main_to_aux[..planes])?;

        for (plane, stream) in aux.iter().enumerate() {
            for step in 0..n - 1 {
                let group = if step < local_hop {
                    &args.sub_groups[planes + plane]
                } else {
                    &args.sub_groups[plane]
                };
                let send_idx = (local_rank + n - step) % n;
                let recv_idx = (local_rank + 2 * n - step - 1) % n;
                let send = self.parts[send_idx][plane];
                let recv = self.parts[recv_idx][plane];
                tracing::trace!(
                    local_rank,
                    plane,
                    step,
                    bytes = send.size,
                    local = step < local_hop,
                    "striped ring step"
                );
                for sub in send.split(sub_slices, elem).into_iter().filter(|s| !s.is_empty()) {
                    group.links[next].tx_async(
                        UserMemType::OutputMem,
                        sub.offset as u64,
                        &args.block(sub)?,
                        stream,
                    )?;
                }
                for sub in recv.split(sub_slices, elem).into_iter().filter(|s| !s.is_empty()) {
                    group.links[prev].rx_async(
                        UserMemType::OutputMem,
                        sub.offset as u64,
                        &args.block(sub)?,
                        stream,
                    )?;
                }
            }
            args.sub_groups[plane].links[prev].rx_wait_done(stream)?;
        }

        finish_aux(d, main, aux, &args.signals.aux_to_main[..planes])?;
        self.core.finish();
        Ok(())
    }
}
