//! Three-phase all-to-all routed through per-plane aggregators.
//!
//! The payload of every ordered rank pair is cut into pieces and piece `i`
//! travels on plane `i mod P`. Each plane has one aggregator per node:
//!
//! - `Gather`: node members hand their pieces for every destination to the
//!   plane's aggregator.
//! - `Inter`: aggregators of the same plane exchange, node to node, the
//!   pieces addressed to ranks behind the other node.
//! - `Scatter`: aggregators forward each received piece to its owner.
//!
//! Scratch holds two regions of `node_size * world` pair blocks: `G[l][d]`,
//! what local rank `l` sends to `d`, and `X[s][j]`, what source `s` sends
//! to local rank `j`.

use crate::error::{HcollError, Result};
use crate::link::{LinkRef, execute_barrier};
use crate::memory::DeviceMem;
use crate::slice::Slice;
use crate::stream::Stream;
use crate::sync::{finish_aux, start_aux};
use crate::template::{
    AlgTemplate, AllToAllPhase, Core, PhasedTemplate, PrepareArgs, TemplateKind, TemplateState,
};
use crate::types::UserMemType;

/// Pieces of one pair payload, grouped by plane. Piece `i` covers
/// `[i * len, (i + 1) * len)` with `len` aligned down, the last piece takes
/// the remainder, and empty pieces are dropped.
pub fn piece_plan(pair_bytes: usize, pieces: usize, planes: usize, align: usize) -> Vec<Vec<Slice>> {
    let planes = planes.max(1);
    let mut plan = vec![Vec::new(); planes];
    for (i, piece) in Slice::new(0, pair_bytes)
        .split(pieces.max(1), align)
        .into_iter()
        .enumerate()
    {
        if !piece.is_empty() {
            plan[i % planes].push(piece);
        }
    }
    plan
}

/// How node-local and node-to-node peers map onto a plane's link indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIndex {
    /// Intra-node groups for gather/scatter, aggregator groups for inter.
    Hierarchical,
    /// One group of every rank, indexed by global rank.
    Flattened { node_size: usize },
}

impl PeerIndex {
    fn local(self, node: usize, j: usize) -> usize {
        match self {
            PeerIndex::Hierarchical => j,
            PeerIndex::Flattened { node_size } => node * node_size + j,
        }
    }

    fn node(self, node: usize, aggregator: usize) -> usize {
        match self {
            PeerIndex::Hierarchical => node,
            PeerIndex::Flattened { node_size } => node * node_size + aggregator,
        }
    }
}

/// Offsets of the per-pair blocks in input, output and scratch.
#[derive(Debug, Clone, Copy)]
struct Layout {
    node_size: usize,
    node_count: usize,
    node_index: usize,
    local_index: usize,
    pair_bytes: usize,
}

impl Layout {
    fn from_args(a: &PrepareArgs) -> Self {
        Self {
            node_size: a.topo.node_size,
            node_count: a.topo.node_count,
            node_index: a.topo.node_index,
            local_index: a.topo.local_index,
            pair_bytes: a.count * a.elem_size(),
        }
    }

    fn world(&self) -> usize {
        self.node_size * self.node_count
    }

    fn gathered(&self, l: usize, d: usize) -> usize {
        (l * self.world() + d) * self.pair_bytes
    }

    fn exchanged(&self, s: usize, j: usize) -> usize {
        (self.node_size * self.world() + s * self.node_size + j) * self.pair_bytes
    }

    fn scratch_bytes(&self) -> usize {
        2 * self.node_size * self.world() * self.pair_bytes
    }
}

pub struct AllToAllSliced {
    core: Core,
    phase: Option<AllToAllPhase>,
    aggregators: Option<Vec<usize>>,
}

impl AllToAllSliced {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllToAllSliced),
            phase: None,
            aggregators: None,
        }
    }

    /// Phase that the next `run_async` executes.
    pub fn phase(&self) -> Option<AllToAllPhase> {
        self.phase
    }
}

impl Default for AllToAllSliced {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregator of each plane: the custom list, or local rank `p % node_size`
/// for plane `p`.
fn resolve_aggregators(custom: Option<&[usize]>, planes: usize, node_size: usize) -> Result<Vec<usize>> {
    let aggregators: Vec<usize> = match custom {
        Some(v) => v.to_vec(),
        None => (0..planes).map(|p| p % node_size).collect(),
    };
    if aggregators.len() < planes || aggregators.iter().any(|&a| a >= node_size) {
        return Err(HcollError::param(
            "alltoall_sliced",
            format!("aggregators {aggregators:?} invalid for {planes} planes of {node_size} ranks"),
        ));
    }
    Ok(aggregators)
}

fn peer_index(a: &PrepareArgs, lay: &Layout) -> PeerIndex {
    if a.topo.flattened {
        PeerIndex::Flattened {
            node_size: lay.node_size,
        }
    } else {
        PeerIndex::Hierarchical
    }
}

/// Checks that depend on the phase being run. Returns the aggregators,
/// empty for a single rank.
fn check_run(a: &PrepareArgs, phase: AllToAllPhase, local_rank: usize, custom: Option<&[usize]>) -> Result<Vec<usize>> {
    let lay = Layout::from_args(a);
    if lay.world() == 1 {
        return Ok(Vec::new());
    }
    let planes = a.ctx.config.alltoall_planes.max(1);
    let aggregators = resolve_aggregators(custom, planes, lay.node_size)?;
    let expected_rank = match (peer_index(a, &lay), phase) {
        (PeerIndex::Flattened { .. }, _) => lay.node_index * lay.node_size + lay.local_index,
        (PeerIndex::Hierarchical, AllToAllPhase::Inter) => lay.node_index,
        (PeerIndex::Hierarchical, _) => lay.local_index,
    };
    if expected_rank != local_rank {
        return Err(HcollError::param(
            "alltoall_sliced",
            format!("{phase:?} runs as local rank {local_rank}, expected {expected_rank}"),
        ));
    }
    Ok(aggregators)
}

fn check(a: &PrepareArgs, custom: Option<&[usize]>) -> Result<()> {
    a.check_group("alltoall_sliced")?;
    let lay = Layout::from_args(a);
    if lay.node_size == 0
        || lay.node_count == 0
        || lay.local_index >= lay.node_size
        || lay.node_index >= lay.node_count
    {
        return Err(HcollError::param(
            "alltoall_sliced",
            format!(
                "rank {}:{} outside {} nodes of {}",
                lay.node_index, lay.local_index, lay.node_count, lay.node_size
            ),
        ));
    }
    let block = lay.world() * lay.pair_bytes;
    for (name, mem) in [("input", &a.mem.input), ("output", &a.mem.output)] {
        if mem.len() < block {
            return Err(HcollError::param(
                "alltoall_sliced",
                format!("{name} holds {} bytes, need {block}", mem.len()),
            ));
        }
    }
    if lay.world() == 1 {
        return Ok(());
    }
    a.mem.scratch_at_least(lay.scratch_bytes())?;
    let planes = a.ctx.config.alltoall_planes.max(1);
    a.check_aux(planes)?;
    if a.sub_groups.len() < planes {
        return Err(HcollError::param(
            "alltoall_sliced",
            format!("{} link sets for {planes} planes", a.sub_groups.len()),
        ));
    }
    resolve_aggregators(custom, planes, lay.node_size)?;
    Ok(())
}

impl AlgTemplate for AllToAllSliced {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllToAllSliced
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        let custom = self.aggregators.as_deref();
        self.core.prepare(args, |a| check(a, custom))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let phase = self
            .phase
            .ok_or_else(|| HcollError::param("alltoall_sliced", "phase not set"))?;
        let aggregators = match self.core.prepared() {
            Some(a) => check_run(a, phase, local_rank, self.aggregators.as_deref())?,
            None => Vec::new(),
        };
        let args = self.core.begin(local_rank, group_size, links)?;
        let lay = Layout::from_args(args);

        if lay.world() == 1 {
            // Only the own pair block moves, and only once.
            if phase == AllToAllPhase::Gather {
                let d = args.ctx.dispatcher.as_ref();
                d.memcpy_async(
                    &args.main_stream,
                    &args.mem.output.range(0, lay.pair_bytes)?,
                    &args.mem.input.range(0, lay.pair_bytes)?,
                )?;
            }
            self.core.finish();
            return Ok(());
        }

        let cfg = &args.ctx.config;
        let planes = cfg.alltoall_planes.max(1);
        let map = peer_index(args, &lay);

        let plan = piece_plan(lay.pair_bytes, cfg.alltoall_pieces, planes, args.elem_size());
        let is_aggregator = aggregators[..planes].contains(&lay.local_index);
        let joins = map != PeerIndex::Hierarchical || phase != AllToAllPhase::Inter || is_aggregator;
        let d = args.ctx.dispatcher.as_ref();
        let main = &args.main_stream;
        let aux = &args.aux_streams[..planes];

        if joins && group_size > 1 {
            let prev = (local_rank + group_size - 1) % group_size;
            let next = (local_rank + 1) % group_size;
            execute_barrier(links[prev].as_ref(), links[next].as_ref(), main)?;
        }
        start_aux(d, main, aux, &args.signals.main_to_aux[..planes])?;
        for (plane, stream) in aux.iter().enumerate() {
            tracing::trace!(
                phase = ?phase,
                plane,
                aggregator = aggregators[plane],
                pieces = plan[plane].len(),
                "alltoall plane"
            );
            enqueue_plane(args, phase, &lay, map, plane, aggregators[plane], &plan[plane], stream)?;
        }
        finish_aux(d, main, aux, &args.signals.aux_to_main[..planes])?;
        self.core.finish();
        Ok(())
    }

    fn phased(&mut self) -> Option<&mut dyn PhasedTemplate> {
        Some(self)
    }
}

impl PhasedTemplate for AllToAllSliced {
    fn set_mode(&mut self, phase: AllToAllPhase) {
        self.phase = Some(phase);
    }

    fn set_aggregators(&mut self, aggregators: Vec<usize>) -> Result<()> {
        if aggregators.is_empty() {
            return Err(HcollError::param("alltoall_sliced", "empty aggregator list"));
        }
        if let Some(a) = self.core.prepared() {
            let lay = Layout::from_args(a);
            if lay.world() > 1 {
                resolve_aggregators(Some(&aggregators), a.ctx.config.alltoall_planes.max(1), lay.node_size)?;
            }
        }
        self.aggregators = Some(aggregators);
        Ok(())
    }
}

fn piece_view(mem: &DeviceMem, base: usize, piece: Slice) -> Result<DeviceMem> {
    mem.range(base + piece.offset, piece.size)
}

#[allow(clippy::too_many_arguments)]
fn enqueue_plane(
    args: &PrepareArgs,
    phase: AllToAllPhase,
    lay: &Layout,
    map: PeerIndex,
    plane: usize,
    aggregator: usize,
    pieces: &[Slice],
    stream: &Stream,
) -> Result<()> {
    if pieces.is_empty() {
        return Ok(());
    }
    let links = &args.sub_groups[plane].links;
    let d = args.ctx.dispatcher.as_ref();
    let scratch = args.mem.scratch()?;
    let (input, output) = (&args.mem.input, &args.mem.output);
    let (l, m) = (lay.local_index, lay.node_index);
    let world = lay.world();
    let bpp = lay.pair_bytes;
    let is_aggregator = l == aggregator;

    match phase {
        AllToAllPhase::Gather => {
            if !is_aggregator {
                let link = &links[map.local(m, aggregator)];
                for dst in 0..world {
                    for &p in pieces {
                        let at = lay.gathered(l, dst) + p.offset;
                        link.tx_async(UserMemType::ScratchMem, at as u64, &piece_view(input, dst * bpp, p)?, stream)?;
                    }
                }
                return Ok(());
            }
            for dst in 0..world {
                for &p in pieces {
                    d.memcpy_async(
                        stream,
                        &piece_view(scratch, lay.gathered(l, dst), p)?,
                        &piece_view(input, dst * bpp, p)?,
                    )?;
                }
            }
            for j in (0..lay.node_size).filter(|&j| j != l) {
                let link = &links[map.local(m, j)];
                for dst in 0..world {
                    for &p in pieces {
                        let view = piece_view(scratch, lay.gathered(j, dst), p)?;
                        link.rx_async(UserMemType::ScratchMem, (lay.gathered(j, dst) + p.offset) as u64, &view, stream)?;
                    }
                }
            }
        }
        AllToAllPhase::Inter => {
            if !is_aggregator {
                return Ok(());
            }
            let others: Vec<usize> = (0..lay.node_count).filter(|&n| n != m).collect();
            for &peer in &others {
                let link = &links[map.node(peer, aggregator)];
                for src in 0..lay.node_size {
                    for j in 0..lay.node_size {
                        let dst = peer * lay.node_size + j;
                        for &p in pieces {
                            let at = lay.exchanged(m * lay.node_size + src, j) + p.offset;
                            link.tx_async(
                                UserMemType::ScratchMem,
                                at as u64,
                                &piece_view(scratch, lay.gathered(src, dst), p)?,
                                stream,
                            )?;
                        }
                    }
                }
            }
            for src in 0..lay.node_size {
                for j in 0..lay.node_size {
                    for &p in pieces {
                        d.memcpy_async(
                            stream,
                            &piece_view(scratch, lay.exchanged(m * lay.node_size + src, j), p)?,
                            &piece_view(scratch, lay.gathered(src, m * lay.node_size + j), p)?,
                        )?;
                    }
                }
            }
            for &peer in &others {
                let link = &links[map.node(peer, aggregator)];
                for src in 0..lay.node_size {
                    let s = peer * lay.node_size + src;
                    for j in 0..lay.node_size {
                        for &p in pieces {
                            let at = lay.exchanged(s, j);
                            link.rx_async(
                                UserMemType::ScratchMem,
                                (at + p.offset) as u64,
                                &piece_view(scratch, at, p)?,
                                stream,
                            )?;
                        }
                    }
                }
            }
        }
        AllToAllPhase::Scatter => {
            if !is_aggregator {
                let link = &links[map.local(m, aggregator)];
                for src in 0..world {
                    for &p in pieces {
                        link.rx_async(
                            UserMemType::OutputMem,
                            (src * bpp + p.offset) as u64,
                            &piece_view(output, src * bpp, p)?,
                            stream,
                        )?;
                    }
                }
                return Ok(());
            }
            for j in 0..lay.node_size {
                if j == l {
                    for src in 0..world {
                        for &p in pieces {
                            d.memcpy_async(
                                stream,
                                &piece_view(output, src * bpp, p)?,
                                &piece_view(scratch, lay.exchanged(src, j), p)?,
                            )?;
                        }
                    }
                    continue;
                }
                let link = &links[map.local(m, j)];
                for src in 0..world {
                    for &p in pieces {
                        link.tx_async(
                            UserMemType::OutputMem,
                            (src * bpp + p.offset) as u64,
                            &piece_view(scratch, lay.exchanged(src, j), p)?,
                            stream,
                        )?;
                    }
                }
            }
        }
    }
    Ok(())
}
