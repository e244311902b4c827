use crate::error::Result;
use crate::memory::DeviceMem;
use crate::stream::{Signal, Stream};
use crate::template::SignalPairs;

/// What one operation needs from the external resource manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub scratch_bytes: usize,
    /// Auxiliary streams; each comes with one signal pair.
    pub stream_count: usize,
    pub signal_count: usize,
    /// The output is strided and needs a dense staging copy.
    pub needs_staging_buffer: bool,
    pub staging_bytes: usize,
}

impl ResourceRequest {
    /// Combined request of two steps that run one after the other.
    pub fn max(self, other: ResourceRequest) -> ResourceRequest {
        ResourceRequest {
            scratch_bytes: self.scratch_bytes.max(other.scratch_bytes),
            stream_count: self.stream_count.max(other.stream_count),
            signal_count: self.signal_count.max(other.signal_count),
            needs_staging_buffer: self.needs_staging_buffer || other.needs_staging_buffer,
            staging_bytes: self.staging_bytes.max(other.staging_bytes),
        }
    }

    /// Request for `n` auxiliary streams and as many signal pairs.
    pub fn aux(n: usize) -> ResourceRequest {
        ResourceRequest {
            stream_count: n,
            signal_count: n,
            ..Default::default()
        }
    }
}

/// Resources handed out for one operation instance.
#[derive(Debug, Clone, Default)]
pub struct ResourceResponse {
    pub staging_input: Option<DeviceMem>,
    pub staging_output: Option<DeviceMem>,
    pub scratch: Option<DeviceMem>,
    pub aux_streams: Vec<Stream>,
    pub signals: SignalPairs,
}

impl ResourceResponse {
    /// Host-side allocation of `req`. Stream and signal ids start at `id_base`.
    pub fn allocate(req: &ResourceRequest, id_base: u32) -> Result<Self> {
        let aux_streams = (0..req.stream_count)
            .map(|i| Stream::new(id_base + i as u32))
            .collect::<Result<Vec<_>>>()?;
        let signals = SignalPairs {
            main_to_aux: (0..req.signal_count)
                .map(|i| Signal::new(id_base + 2 * i as u32))
                .collect(),
            aux_to_main: (0..req.signal_count)
                .map(|i| Signal::new(id_base + 2 * i as u32 + 1))
                .collect(),
        };
        Ok(Self {
            staging_input: None,
            staging_output: req
                .needs_staging_buffer
                .then(|| DeviceMem::alloc(req.staging_bytes)),
            scratch: (req.scratch_bytes > 0).then(|| DeviceMem::alloc(req.scratch_bytes)),
            aux_streams,
            signals,
        })
    }
}
