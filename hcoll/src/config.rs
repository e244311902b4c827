//! Tuning parameters for algorithm selection and template scheduling.
//!
//! All values have sensible defaults. The core never reads the environment
//! by itself; the operator layer builds an `HcollConfig` (optionally through
//! [`HcollConfig::from_env`]) and hands it to the selector and executor.

use std::time::Duration;

use crate::template::PlaneSplit;

/// Default per-plane bandwidth table: seven local-interconnect planes plus
/// one faster remote plane (GB/s).
pub const DEFAULT_PLANE_BANDWIDTH: [f64; 8] = [28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 28.0, 50.0];

/// Tuning parameters consumed by the selector and executor.
#[derive(Debug, Clone)]
pub struct HcollConfig {
    /// Fixed per-step latency used by the cost models, in microseconds.
    pub latency_us: f64,

    /// Measured bandwidth per topology level, in GB/s. Levels past the end
    /// of the table reuse its last entry.
    pub level_bandwidth_gbps: Vec<f64>,

    /// Pipelining threshold for all-gather/reduce-scatter when the transport
    /// supports lite RDMA.
    pub pipeline_min_bytes_lite: u64,

    /// Pipelining threshold for all-reduce (per slice) when the transport
    /// supports lite RDMA.
    pub pipeline_allreduce_min_bytes_lite: u64,

    /// Pipelining threshold without lite RDMA, for all operation kinds.
    pub pipeline_min_bytes: u64,

    /// Whether the transport supports lite RDMA.
    pub rdma_lite: bool,

    /// Platform ceiling on scheduled task contexts for one pipelined op.
    pub context_budget: u64,

    /// Deterministic reductions forbid reordering, which rules out the
    /// pipelined reduce paths.
    pub deterministic: bool,

    /// Size of the per-loop communication buffer. Cost models evaluate
    /// `min(size, ccl_buffer_bytes)`.
    pub ccl_buffer_bytes: u64,

    /// How the striped all-gather divides a rank's contribution across planes.
    pub plane_split: PlaneSplit,

    /// Alignment of plane byte shares.
    pub plane_align_bytes: usize,

    /// Sub-slices per ring step in the striped all-gather.
    pub pipeline_sub_slices: usize,

    /// Pieces per ordered rank pair in the sliced all-to-all.
    pub alltoall_pieces: usize,

    /// Logical planes in the sliced all-to-all.
    pub alltoall_planes: usize,

    /// Run the sliced all-to-all against the flattened group instead of
    /// per-phase sub-groups.
    pub alltoall_flattened: bool,

    /// Pipeline chunks for the chained broadcast.
    pub broadcast_chunks: usize,

    /// Timeout for a single receive on a link.
    pub transfer_timeout: Duration,
}

impl Default for HcollConfig {
    fn default() -> Self {
        Self {
            latency_us: 60.0,
            level_bandwidth_gbps: vec![50.0, 12.5, 12.5],
            pipeline_min_bytes_lite: 32 * 1024,
            pipeline_allreduce_min_bytes_lite: 1024 * 1024,
            pipeline_min_bytes: 2 * 1024 * 1024,
            rdma_lite: true,
            context_budget: 65535,
            deterministic: false,
            ccl_buffer_bytes: 200 * 1024 * 1024,
            plane_split: PlaneSplit::Bandwidth(DEFAULT_PLANE_BANDWIDTH.to_vec()),
            plane_align_bytes: 32,
            pipeline_sub_slices: 8,
            alltoall_pieces: 128,
            alltoall_planes: 7,
            alltoall_flattened: false,
            broadcast_chunks: 4,
            transfer_timeout: Duration::from_secs(30),
        }
    }
}

impl HcollConfig {
    /// Bandwidth of `level` in GB/s.
    pub fn bandwidth_gbps(&self, level: usize) -> f64 {
        self.level_bandwidth_gbps
            .get(level)
            .or(self.level_bandwidth_gbps.last())
            .copied()
            .unwrap_or(1.0)
    }

    /// Number of striped planes implied by `plane_split`.
    pub fn plane_count(&self) -> usize {
        self.plane_split.plane_count()
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `HCOLL_LATENCY_US`
    /// - `HCOLL_PIPELINE_MIN_BYTES_LITE`
    /// - `HCOLL_PIPELINE_ALLREDUCE_MIN_BYTES_LITE`
    /// - `HCOLL_PIPELINE_MIN_BYTES`
    /// - `HCOLL_RDMA_LITE` (`0`/`1`)
    /// - `HCOLL_CONTEXT_BUDGET`
    /// - `HCOLL_DETERMINISTIC` (`0`/`1`)
    /// - `HCOLL_CCL_BUFFER_BYTES`
    /// - `HCOLL_PLANE_EQUAL_SPLIT` (plane count; switches to an equal split)
    /// - `HCOLL_ALLTOALL_PIECES`
    /// - `HCOLL_ALLTOALL_PLANES`
    /// - `HCOLL_TRANSFER_TIMEOUT_SECS`
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HCOLL_LATENCY_US") {
            if let Ok(n) = v.parse::<f64>() {
                cfg.latency_us = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_PIPELINE_MIN_BYTES_LITE") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.pipeline_min_bytes_lite = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_PIPELINE_ALLREDUCE_MIN_BYTES_LITE") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.pipeline_allreduce_min_bytes_lite = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_PIPELINE_MIN_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.pipeline_min_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_RDMA_LITE") {
            cfg.rdma_lite = parse_flag(&v).unwrap_or(cfg.rdma_lite);
        }
        if let Ok(v) = std::env::var("HCOLL_CONTEXT_BUDGET") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.context_budget = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_DETERMINISTIC") {
            cfg.deterministic = parse_flag(&v).unwrap_or(cfg.deterministic);
        }
        if let Ok(v) = std::env::var("HCOLL_CCL_BUFFER_BYTES") {
            if let Ok(n) = v.parse::<u64>() {
                cfg.ccl_buffer_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("HCOLL_PLANE_EQUAL_SPLIT") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.plane_split = PlaneSplit::Equal(n);
                }
            }
        }
        if let Ok(v) = std::env::var("HCOLL_ALLTOALL_PIECES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.alltoall_pieces = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("HCOLL_ALLTOALL_PLANES") {
            if let Ok(n) = v.parse::<usize>() {
                cfg.alltoall_planes = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("HCOLL_TRANSFER_TIMEOUT_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                cfg.transfer_timeout = Duration::from_secs(s);
            }
        }

        cfg
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim() {
        "1" | "true" | "on" => Some(true),
        "0" | "false" | "off" => Some(false),
        _ => None,
    }
}
