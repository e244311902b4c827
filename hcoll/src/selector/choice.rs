use crate::error::{HcollError, Result};

/// Bits reserved for one level's label inside an [`AlgorithmChoice`].
pub const LEVEL_ALGO_WIDTH: u32 = 8;

/// Maximum number of levels an [`AlgorithmChoice`] can describe.
pub const MAX_LEVELS: usize = 3;

/// Communication pattern run at one topology level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Algorithm {
    Ring = 1,
    /// Non-uniform hierarchical ring: log-step neighbor exchange.
    Nhr = 2,
    HalvingDoubling = 3,
    Mesh = 4,
    /// Striped multi-plane pipeline.
    Pipeline = 5,
}

impl Algorithm {
    pub const fn name(self) -> &'static str {
        match self {
            Algorithm::Ring => "ring",
            Algorithm::Nhr => "nhr",
            Algorithm::HalvingDoubling => "hd",
            Algorithm::Mesh => "mesh",
            Algorithm::Pipeline => "pipeline",
        }
    }

    const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Algorithm::Ring),
            2 => Some(Algorithm::Nhr),
            3 => Some(Algorithm::HalvingDoubling),
            4 => Some(Algorithm::Mesh),
            5 => Some(Algorithm::Pipeline),
            _ => None,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One [`Algorithm`] per topology level packed into a `u32`.
///
/// Level `k` occupies bits `[k * LEVEL_ALGO_WIDTH, (k + 1) * LEVEL_ALGO_WIDTH)`;
/// an all-zero field means the level has no label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AlgorithmChoice(u32);

impl AlgorithmChoice {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Choice with `algs[k]` at level `k`.
    pub fn from_levels(algs: &[Algorithm]) -> Result<Self> {
        let mut choice = Self::empty();
        for (level, &alg) in algs.iter().enumerate() {
            choice = choice.with_level(level, alg)?;
        }
        Ok(choice)
    }

    pub fn with_level(self, level: usize, alg: Algorithm) -> Result<Self> {
        if level >= MAX_LEVELS {
            return Err(HcollError::param(
                "algorithm_choice",
                format!("level {level} exceeds the {MAX_LEVELS} supported levels"),
            ));
        }
        let shift = level as u32 * LEVEL_ALGO_WIDTH;
        let mask = ((1u32 << LEVEL_ALGO_WIDTH) - 1) << shift;
        Ok(Self((self.0 & !mask) | ((alg as u32) << shift)))
    }

    pub fn level(self, level: usize) -> Option<Algorithm> {
        if level >= MAX_LEVELS {
            return None;
        }
        let bits = (self.0 >> (level as u32 * LEVEL_ALGO_WIDTH)) & ((1 << LEVEL_ALGO_WIDTH) - 1);
        Algorithm::from_bits(bits as u8)
    }

    /// Label at `level`, falling back to `Ring` for unlabeled levels.
    pub fn level_or_ring(self, level: usize) -> Algorithm {
        self.level(level).unwrap_or(Algorithm::Ring)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Tag suffix naming every labeled level, e.g. `level0_mesh-level1_nhr`.
    pub fn tag(self) -> String {
        (0..MAX_LEVELS)
            .filter_map(|k| self.level(k).map(|alg| format!("level{k}_{alg}")))
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl std::fmt::Display for AlgorithmChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tag = self.tag();
        if tag.is_empty() {
            f.write_str("unset")
        } else {
            f.write_str(&tag)
        }
    }
}
