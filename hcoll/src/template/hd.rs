//! Recursive-doubling all-gather with a fold for non power-of-two groups.
//!
//! With `p` the largest power of two not above `n` and `rem = n - p`, the
//! first `2 * rem` ranks pair up: each even rank hands its block to its odd
//! neighbor and sits out. The `p` remaining ranks run `log2 p` doubling
//! exchanges and the odd ranks finally hand the full result back.

use crate::error::Result;
use crate::link::LinkRef;
use crate::template::{AlgTemplate, Core, PrepareArgs, TemplateKind, TemplateState};
use crate::types::UserMemType;

/// Rank layout of the folded doubling schedule.
#[derive(Debug, Clone, Copy)]
struct Fold {
    pow2: usize,
    rem: usize,
}

impl Fold {
    fn new(n: usize) -> Self {
        let pow2 = if n == 0 { 0 } else { 1 << (usize::BITS - 1 - n.leading_zeros()) };
        Self { pow2, rem: n - pow2 }
    }

    /// Virtual rank of `r`, or `None` when it sits out.
    fn virtual_rank(&self, r: usize) -> Option<usize> {
        if r < 2 * self.rem {
            (r % 2 == 1).then_some(r / 2)
        } else {
            Some(r - self.rem)
        }
    }

    fn physical(&self, v: usize) -> usize {
        if v < self.rem { 2 * v + 1 } else { v + self.rem }
    }

    /// Physical blocks carried by virtual rank `v`.
    fn blocks(&self, v: usize) -> std::ops::Range<usize> {
        if v < self.rem {
            2 * v..2 * v + 2
        } else {
            v + self.rem..v + self.rem + 1
        }
    }
}

pub struct AllGatherHd {
    core: Core,
}

impl AllGatherHd {
    pub fn new() -> Self {
        Self {
            core: Core::new(TemplateKind::AllGatherHd),
        }
    }
}

impl Default for AllGatherHd {
    fn default() -> Self {
        Self::new()
    }
}

impl AlgTemplate for AllGatherHd {
    fn kind(&self) -> TemplateKind {
        TemplateKind::AllGatherHd
    }

    fn state(&self) -> TemplateState {
        self.core.state()
    }

    fn prepare(&mut self, args: PrepareArgs) -> Result<()> {
        self.core.prepare(args, |a| a.check_slices("allgather_hd"))
    }

    fn run_async(&mut self, local_rank: usize, group_size: usize, links: &[LinkRef]) -> Result<()> {
        let args = self.core.begin(local_rank, group_size, links)?;
        let n = group_size;
        let r = local_rank;
        let stream = &args.main_stream;
        let fold = Fold::new(n);

        let send = |peer: usize, idx: usize| -> Result<()> {
            let s = args.slices[idx];
            links[peer].tx_async(UserMemType::OutputMem, s.offset as u64, &args.block(s)?, stream)
        };
        let recv = |peer: usize, idx: usize| -> Result<()> {
            let s = args.slices[idx];
            links[peer].rx_async(UserMemType::OutputMem, s.offset as u64, &args.block(s)?, stream)
        };

        match fold.virtual_rank(r) {
            None => {
                // Hand over the own block, then take back everything else.
                let partner = r + 1;
                send(partner, r)?;
                for idx in (0..n).filter(|&i| i != r) {
                    recv(partner, idx)?;
                }
            }
            Some(v) => {
                if r < 2 * fold.rem {
                    recv(r - 1, r - 1)?;
                }
                let mut mask = 1usize;
                while mask < fold.pow2 {
                    let pv = v ^ mask;
                    let peer = fold.physical(pv);
                    let mine = v & !(mask - 1);
                    let theirs = pv & !(mask - 1);
                    tracing::trace!(local_rank, mask, peer, "hd exchange");
                    for vv in mine..mine + mask {
                        for idx in fold.blocks(vv) {
                            send(peer, idx)?;
                        }
                    }
                    for vv in theirs..theirs + mask {
                        for idx in fold.blocks(vv) {
                            recv(peer, idx)?;
                        }
                    }
                    mask <<= 1;
                }
                if r < 2 * fold.rem {
                    for idx in (0..n).filter(|&i| i != r - 1) {
                        send(r - 1, idx)?;
                    }
                }
            }
        }
        self.core.finish();
        Ok(())
    }
}
