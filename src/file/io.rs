//! Endian-aware, bounds-checked reading and writing of primitive values.
//!
//! Method bodies, exception sections and trampoline frames are all little-endian on every
//! architecture this crate targets, so only the little-endian half is provided. All functions
//! return [`crate::Error::OutOfBounds`] instead of panicking when the buffer is too short.
//!
//! # Usage Examples
//!
//! ```rust,ignore
//! use dotpatch::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 1u16)?;
//! write_le_at(&mut data, &mut offset, 2u32)?;
//!
//! offset = 0;
//! let first: u16 = read_le_at(&data, &mut offset)?;
//! let second: u32 = read_le_at(&data, &mut offset)?;
//! assert_eq!((first, second, offset), (1, 2, 6));
//! # Ok::<(), dotpatch::Error>(())
//! ```

use crate::Result;

/// Trait for primitive types that can be converted from and to little-endian bytes.
pub trait CilIO: Sized + Copy {
    /// Fixed-size byte array representation of the type
    type Bytes: AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Build the value from little-endian bytes
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Convert the value into little-endian bytes
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cil_io {
    ($($ty:ty => $len:literal),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cil_io!(
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
);

/// Read a value of type `T` from the start of `data` in little-endian format.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is shorter than `T`.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0;
    read_le_at(data, &mut offset)
}

/// Read a value of type `T` at `offset` in little-endian format and advance the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the read would exceed the buffer.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset
        .checked_add(type_len)
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Write `value` at `offset` in little-endian format and advance the offset.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the write would exceed the buffer.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset
        .checked_add(bytes.len())
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}
