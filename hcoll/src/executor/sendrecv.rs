use crate::error::{HcollError, Result};
use crate::executor::{
    ComputesResourceRequest, DecomposesIntoLevels, LevelRunner, LevelStep, OpContext, ResourceRequest,
    RunsTemplate, check_len,
};
use crate::memory::DeviceMem;
use crate::slice::Slice;
use crate::topology::CommPlane;
use crate::types::{Rank, UserMemType};

/// Point-to-point exchange over the combined plane. No template is
/// involved; a rank paired with itself copies locally.
pub(crate) struct SendRecvPlan;

impl ComputesResourceRequest for SendRecvPlan {
    fn resource_request(&self, _cx: &OpContext<'_>) -> Result<ResourceRequest> {
        Ok(ResourceRequest::default())
    }
}

impl DecomposesIntoLevels for SendRecvPlan {
    fn decompose(&self, _cx: &OpContext<'_>, _region: Slice) -> Result<Vec<LevelStep>> {
        Ok(Vec::new())
    }
}

impl RunsTemplate for SendRecvPlan {
    fn run(&self, cx: &OpContext<'_>, runner: &LevelRunner<'_>, input: &DeviceMem, output: &DeviceMem) -> Result<()> {
        let bytes = cx.desc.block_bytes();
        let me = cx.rank;
        let (send_to, recv_from) = (cx.desc.send_to, cx.desc.recv_from);
        match (send_to == Some(me), recv_from == Some(me)) {
            (true, true) => {
                if input.len() != output.len() {
                    return Err(HcollError::BufferSizeMismatch {
                        expected: input.len(),
                        actual: output.len(),
                    });
                }
                check_len("input", input, bytes)?;
                return runner.copy(cx, &output.range(0, bytes)?, &input.range(0, bytes)?);
            }
            (true, false) | (false, true) => {
                return Err(HcollError::param(
                    "send_recv",
                    format!("rank {me} paired with itself on one side only"),
                ));
            }
            (false, false) => {}
        }

        let links = runner.topology().sub_group(CommPlane::Combined, 0)?.links;
        let link_to = |peer: Rank| {
            links
                .get(peer as usize)
                .ok_or_else(|| HcollError::param("send_recv", format!("no link to rank {peer}")))
        };
        let tx = match send_to {
            Some(peer) => {
                check_len("input", input, bytes)?;
                Some((link_to(peer)?, input.range(0, bytes)?))
            }
            None => None,
        };
        let rx = match recv_from {
            Some(peer) => {
                check_len("output", output, bytes)?;
                Some((link_to(peer)?, output.range(0, bytes)?))
            }
            None => None,
        };

        let stream = &cx.desc.stream;
        if let Some((link, view)) = &tx {
            link.tx_async(UserMemType::InputMem, 0, view, stream)?;
        }
        if let Some((link, view)) = &rx {
            link.rx_async(UserMemType::OutputMem, 0, view, stream)?;
        }
        tracing::debug!(tag = %cx.desc.tag, rank = me, ?send_to, ?recv_from, bytes, "send/recv enqueued");
        if let Some((link, _)) = &tx {
            link.tx_wait_done(stream)?;
        }
        if let Some((link, _)) = &rx {
            link.rx_wait_done(stream)?;
        }
        Ok(())
    }
}
