use crate::error::{HcollError, Result};
use crate::memory::DeviceMem;

/// Input, output and scratch views for one operation invocation.
///
/// Created fresh per call. Templates address their slices inside `output`
/// (the working buffer) and stage receives in `scratch`.
#[derive(Debug, Clone)]
pub struct ExecMem {
    pub input: DeviceMem,
    pub output: DeviceMem,
    pub scratch: Option<DeviceMem>,
}

impl ExecMem {
    pub fn new(input: DeviceMem, output: DeviceMem) -> Self {
        Self {
            input,
            output,
            scratch: None,
        }
    }

    pub fn with_scratch(mut self, scratch: DeviceMem) -> Self {
        self.scratch = Some(scratch);
        self
    }

    /// Scratch view, or a resource error if none was allocated.
    pub fn scratch(&self) -> Result<&DeviceMem> {
        self.scratch.as_ref().ok_or(HcollError::MissingBuffer("scratch"))
    }

    /// Scratch view of at least `required` bytes.
    pub fn scratch_at_least(&self, required: usize) -> Result<&DeviceMem> {
        let scratch = self.scratch()?;
        if scratch.len() < required {
            return Err(HcollError::ScratchTooSmall {
                required,
                available: scratch.len(),
            });
        }
        Ok(scratch)
    }
}
