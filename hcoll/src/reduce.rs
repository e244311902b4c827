//! Element-wise reduction used by the reduce-scatter templates.
//!
//! Stands in for the device compute kernel: combines a received byte slice
//! into a local one, interpreting both as `dtype` elements.

use crate::error::{HcollError, Result};
use crate::types::{DataType, ReduceOp};

/// Types that support the four reduction operations.
pub(crate) trait Reducible: Copy + 'static {
    fn reduce(a: Self, b: Self, op: ReduceOp) -> Self;
}

macro_rules! impl_reducible {
    (int: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a.wrapping_add(b),
                        ReduceOp::Prod => a.wrapping_mul(b),
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
    (float: $($ty:ty),*) => {
        $(
            impl Reducible for $ty {
                #[inline]
                fn reduce(a: Self, b: Self, op: ReduceOp) -> Self {
                    match op {
                        ReduceOp::Sum => a + b,
                        ReduceOp::Prod => a * b,
                        ReduceOp::Min => a.min(b),
                        ReduceOp::Max => a.max(b),
                    }
                }
            }
        )*
    };
}

impl_reducible!(int: i8, i32, i64, u8, u32, u64);
impl_reducible!(float: f32, f64);

/// Little-endian element codec (alignment-safe).
trait LeBytes: Sized {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
}

macro_rules! impl_le_bytes {
    ($($ty:ty),*) => {
        $(
            impl LeBytes for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Self::from_le_bytes(raw)
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_le_bytes!(i8, i32, i64, u8, u32, u64, f32, f64);

/// Element-wise `dst = op(dst, src)` over byte slices of `dtype` elements.
///
/// Both slices must have the same length, a multiple of the element size.
pub fn reduce_slice(dst: &mut [u8], src: &[u8], dtype: DataType, op: ReduceOp) -> Result<()> {
    if dst.len() != src.len() {
        return Err(HcollError::BufferSizeMismatch {
            expected: dst.len(),
            actual: src.len(),
        });
    }
    if dst.len() % dtype.size_in_bytes() != 0 {
        return Err(HcollError::param(
            "reduce",
            format!("{} bytes is not a whole number of {dtype}", dst.len()),
        ));
    }
    match dtype {
        DataType::F32 => reduce_typed::<f32>(dst, src, op),
        DataType::F64 => reduce_typed::<f64>(dst, src, op),
        DataType::I32 => reduce_typed::<i32>(dst, src, op),
        DataType::I64 => reduce_typed::<i64>(dst, src, op),
        DataType::U32 => reduce_typed::<u32>(dst, src, op),
        DataType::U64 => reduce_typed::<u64>(dst, src, op),
        DataType::I8 => reduce_typed::<i8>(dst, src, op),
        DataType::U8 => reduce_typed::<u8>(dst, src, op),
        DataType::F16 | DataType::BF16 => {
            return Err(HcollError::UnsupportedDType { dtype, op: "reduce" });
        }
    }
    Ok(())
}

/// Whether `reduce_slice` supports `dtype`, checked before any transfer.
pub fn check_reducible(dtype: DataType) -> Result<()> {
    match dtype {
        DataType::F16 | DataType::BF16 => Err(HcollError::UnsupportedDType { dtype, op: "reduce" }),
        _ => Ok(()),
    }
}

fn reduce_typed<T: Reducible + LeBytes>(dst: &mut [u8], src: &[u8], op: ReduceOp) {
    for (d, s) in dst.chunks_exact_mut(T::SIZE).zip(src.chunks_exact(T::SIZE)) {
        let r = T::reduce(T::read_le(d), T::read_le(s), op);
        r.write_le(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bytes(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    #[test]
    fn test_reduce_slice_sum_f32() {
        let mut dst = f32_bytes(&[1.0, 2.0, 3.0, 4.0]);
        let src = f32_bytes(&[10.0, 20.0, 30.0, 40.0]);
        reduce_slice(&mut dst, &src, DataType::F32, ReduceOp::Sum).unwrap();
        assert_eq!(dst, f32_bytes(&[11.0, 22.0, 33.0, 44.0]));
    }

    #[test]
    fn test_reduce_slice_max_i32() {
        let mut dst: Vec<u8> = [1i32, 50, -3].iter().flat_map(|x| x.to_le_bytes()).collect();
        let src: Vec<u8> = [7i32, 2, -9].iter().flat_map(|x| x.to_le_bytes()).collect();
        reduce_slice(&mut dst, &src, DataType::I32, ReduceOp::Max).unwrap();
        let out: Vec<u8> = [7i32, 50, -3].iter().flat_map(|x| x.to_le_bytes()).collect();
        assert_eq!(dst, out);
    }

    #[test]
    fn test_reduce_slice_unsupported() {
        let mut dst = [0u8; 4];
        let src = [0u8; 4];
        let result = reduce_slice(&mut dst, &src, DataType::F16, ReduceOp::Sum);
        assert!(matches!(result, Err(HcollError::UnsupportedDType { .. })));
        assert!(check_reducible(DataType::BF16).is_err());
        assert!(check_reducible(DataType::I8).is_ok());
    }

    #[test]
    fn test_reduce_slice_length_mismatch() {
        let mut dst = [0u8; 8];
        let src = [0u8; 4];
        assert!(reduce_slice(&mut dst, &src, DataType::U8, ReduceOp::Sum).is_err());
    }
}
