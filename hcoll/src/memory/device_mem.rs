//! Host-side model of device memory views.
//!
//! A `DeviceMem` is a cheap, cloneable `(allocation, offset, len)` view.
//! Sub-views share the allocation; writes through disjoint views may run
//! concurrently from different streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{HcollError, Result};

static NEXT_ALLOCATION: AtomicU64 = AtomicU64::new(1);

struct Allocation {
    id: u64,
    bytes: Mutex<Vec<u8>>,
}

/// A bounds-checked byte view over a device allocation.
#[derive(Clone)]
pub struct DeviceMem {
    alloc: Arc<Allocation>,
    offset: usize,
    len: usize,
}

impl DeviceMem {
    /// Allocate `len` zeroed bytes.
    pub fn alloc(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    /// Wrap existing bytes in a fresh allocation.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let len = bytes.len();
        Self {
            alloc: Arc::new(Allocation {
                id: NEXT_ALLOCATION.fetch_add(1, Ordering::Relaxed),
                bytes: Mutex::new(bytes),
            }),
            offset: 0,
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Offset of this view within its allocation.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Sub-view of `len` bytes starting `offset` bytes into this view.
    pub fn range(&self, offset: usize, len: usize) -> Result<DeviceMem> {
        let end = offset.checked_add(len).ok_or(HcollError::OutOfBounds {
            offset,
            len,
            capacity: self.len,
        })?;
        if end > self.len {
            return Err(HcollError::OutOfBounds {
                offset,
                len,
                capacity: self.len,
            });
        }
        Ok(Self {
            alloc: Arc::clone(&self.alloc),
            offset: self.offset + offset,
            len,
        })
    }

    /// Whether both views address the same allocation.
    pub fn same_allocation(&self, other: &DeviceMem) -> bool {
        self.alloc.id == other.alloc.id
    }

    /// Whether both views touch at least one common byte.
    pub fn overlaps(&self, other: &DeviceMem) -> bool {
        self.same_allocation(other)
            && self.len > 0
            && other.len > 0
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }

    /// Copy the view out.
    pub fn read(&self) -> Result<Vec<u8>> {
        let guard = self.lock()?;
        Ok(guard[self.offset..self.offset + self.len].to_vec())
    }

    /// Overwrite the whole view with `data`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.len {
            return Err(HcollError::BufferSizeMismatch {
                expected: self.len,
                actual: data.len(),
            });
        }
        let mut guard = self.lock()?;
        guard[self.offset..self.offset + self.len].copy_from_slice(data);
        Ok(())
    }

    /// Device-to-device copy of `src` into this view. Lengths must match.
    pub fn copy_from(&self, src: &DeviceMem) -> Result<()> {
        if src.len != self.len {
            return Err(HcollError::BufferSizeMismatch {
                expected: self.len,
                actual: src.len,
            });
        }
        if self.len == 0 {
            return Ok(());
        }
        if self.same_allocation(src) {
            let mut guard = self.lock()?;
            guard.copy_within(src.offset..src.offset + src.len, self.offset);
            return Ok(());
        }
        let data = src.read()?;
        self.write(&data)
    }

    /// Mutate the view in place under the allocation lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut [u8]) -> Result<R>) -> Result<R> {
        let mut guard = self.lock()?;
        f(&mut guard[self.offset..self.offset + self.len])
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Vec<u8>>> {
        self.alloc
            .bytes
            .lock()
            .map_err(|_| HcollError::LockPoisoned("device memory"))
    }
}

impl std::fmt::Debug for DeviceMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMem")
            .field("alloc", &self.alloc.id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

impl std::fmt::Display for DeviceMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem#{}[{}..{}]", self.alloc.id, self.offset, self.offset + self.len)
    }
}
