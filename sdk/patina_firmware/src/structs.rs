//! Declarative fixed-layout binary structures.
//!
//! Every on-disk header in this crate is described once with [`binary_struct!`]: an ordered list of
//! fields, each with a width taken from its type, a struct-wide byte order, and an optional
//! `constant(..)` (a value the field must hold) or `default(..)` (the value used by `Default`). The
//! macro generates bounds-checked `parse`/`validate`/`write_into`/`to_bytes` on top of `scroll`.
//!
//! ```ignore
//! binary_struct! {
//!     pub struct Example: LE {
//!         signature: u32 = constant(0x4856_465F),
//!         length: U24,
//!         revision: u8 = default(2),
//!     }
//! }
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::String};
use r_efi::efi;
use scroll::{Endian, Pread, Pwrite};

use crate::{
    error::{FirmwareError, Result},
    guid,
};

/// A value stored at a fixed width inside a [`binary_struct!`] table.
pub trait StructField: Copy + PartialEq {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// The all-zero value.
    fn zeroed() -> Self;

    /// Reads the field at `offset`, advancing it.
    fn read(buf: &[u8], offset: &mut usize, endian: Endian) -> Result<Self>;

    /// Writes the field at `offset`, advancing it.
    fn write(&self, buf: &mut [u8], offset: &mut usize, endian: Endian) -> Result<()>;

    /// Formats the value for diagnostics.
    fn describe(&self) -> String;
}

macro_rules! int_field {
    ($($ty:ty),*) => {$(
        impl StructField for $ty {
            const WIDTH: usize = core::mem::size_of::<$ty>();

            fn zeroed() -> Self {
                0
            }

            fn read(buf: &[u8], offset: &mut usize, endian: Endian) -> Result<Self> {
                Ok(buf.gread_with::<$ty>(offset, endian)?)
            }

            fn write(&self, buf: &mut [u8], offset: &mut usize, endian: Endian) -> Result<()> {
                buf.gwrite_with::<$ty>(*self, offset, endian)?;
                Ok(())
            }

            fn describe(&self) -> String {
                format!("{:#x}", self)
            }
        }
    )*};
}

int_field!(u8, u16, u32, u64);

/// A 24-bit unsigned integer, as used by FFS file and section sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct U24(pub u32);

impl U24 {
    pub const MAX: u32 = 0x00FF_FFFF;
}

impl StructField for U24 {
    const WIDTH: usize = 3;

    fn zeroed() -> Self {
        U24(0)
    }

    fn read(buf: &[u8], offset: &mut usize, endian: Endian) -> Result<Self> {
        let bytes: &[u8] = buf.gread_with(offset, 3)?;
        let value = if endian.is_little() {
            u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0])
        } else {
            u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]])
        };
        Ok(U24(value))
    }

    fn write(&self, buf: &mut [u8], offset: &mut usize, endian: Endian) -> Result<()> {
        if self.0 > U24::MAX {
            Err(FirmwareError::invalid_data(format!("0x{:x} does not fit in 24 bits", self.0)))?;
        }
        let bytes = if endian.is_little() {
            let le = self.0.to_le_bytes();
            [le[0], le[1], le[2]]
        } else {
            let be = self.0.to_be_bytes();
            [be[1], be[2], be[3]]
        };
        buf.gwrite(&bytes[..], offset)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{:#x}", self.0)
    }
}

impl<const N: usize> StructField for [u8; N] {
    const WIDTH: usize = N;

    fn zeroed() -> Self {
        [0; N]
    }

    fn read(buf: &[u8], offset: &mut usize, _endian: Endian) -> Result<Self> {
        let bytes: &[u8] = buf.gread_with(offset, N)?;
        let mut value = [0u8; N];
        value.copy_from_slice(bytes);
        Ok(value)
    }

    fn write(&self, buf: &mut [u8], offset: &mut usize, _endian: Endian) -> Result<()> {
        buf.gwrite(&self[..], offset)?;
        Ok(())
    }

    fn describe(&self) -> String {
        hex::encode(self)
    }
}

// GUIDs keep their mixed-endian encoding regardless of the struct byte order.
impl StructField for efi::Guid {
    const WIDTH: usize = 16;

    fn zeroed() -> Self {
        efi::Guid::from_bytes(&[0; 16])
    }

    fn read(buf: &[u8], offset: &mut usize, endian: Endian) -> Result<Self> {
        <[u8; 16]>::read(buf, offset, endian).map(|bytes| efi::Guid::from_bytes(&bytes))
    }

    fn write(&self, buf: &mut [u8], offset: &mut usize, endian: Endian) -> Result<()> {
        self.as_bytes().write(buf, offset, endian)
    }

    fn describe(&self) -> String {
        guid::to_string(self)
    }
}

/// Checks that `size` bytes starting at `offset` are available in `buf`.
pub fn check_window(name: &str, buf: &[u8], offset: usize, size: usize) -> Result<()> {
    match offset.checked_add(size) {
        Some(end) if end <= buf.len() => Ok(()),
        _ => Err(FirmwareError::invalid_data(format!(
            "{name} requires 0x{size:x} bytes at offset 0x{offset:x}, buffer is 0x{:x} bytes",
            buf.len()
        ))),
    }
}

/// Builds the error raised when a `constant(..)` field holds the wrong value.
pub fn constant_mismatch<T: StructField>(name: &str, field: &str, expected: &T, got: &T) -> FirmwareError {
    FirmwareError::invalid_data(format!(
        "constant {name}.{field} was not valid, expected {} and got {}",
        expected.describe(),
        got.describe()
    ))
}

macro_rules! binary_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident : $endian:ident {
            $(
                $(#[$field_meta:meta])*
                $field:ident : $ty:ty $(= $init:ident($value:expr))?
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name {
            $(
                $(#[$field_meta])*
                pub $field: $ty,
            )*
        }

        #[allow(dead_code)]
        impl $name {
            /// Encoded size in bytes.
            pub const SIZE: usize = 0 $(+ <$ty as $crate::structs::StructField>::WIDTH)*;
            const ENDIAN: scroll::Endian = scroll::$endian;

            /// Reads the structure at `offset`, checking bounds and every constant field.
            pub fn parse(buf: &[u8], offset: usize) -> $crate::error::Result<Self> {
                $crate::structs::check_window(stringify!($name), buf, offset, Self::SIZE)?;
                let mut cursor = offset;
                $(
                    let $field = <$ty as $crate::structs::StructField>::read(buf, &mut cursor, Self::ENDIAN)?;
                )*
                let value = Self { $($field),* };
                value.check_constants()?;
                Ok(value)
            }

            /// Checks bounds and constants without keeping the parsed value.
            pub fn validate(buf: &[u8], offset: usize) -> $crate::error::Result<()> {
                Self::parse(buf, offset).map(|_| ())
            }

            /// Fails if any `constant(..)` field disagrees with its required value.
            pub fn check_constants(&self) -> $crate::error::Result<()> {
                $(
                    $crate::structs::binary_struct!(@check self, $name, $field, $ty $(, $init, $value)?);
                )*
                Ok(())
            }

            /// Writes every field at its fixed offset, starting at `offset`.
            pub fn write_into(&self, buf: &mut [u8], offset: usize) -> $crate::error::Result<()> {
                $crate::structs::check_window(stringify!($name), buf, offset, Self::SIZE)?;
                let mut cursor = offset;
                $(
                    <$ty as $crate::structs::StructField>::write(&self.$field, buf, &mut cursor, Self::ENDIAN)?;
                )*
                Ok(())
            }

            /// Serializes the structure into a freshly sized buffer.
            pub fn to_bytes(&self) -> $crate::error::Result<alloc::vec::Vec<u8>> {
                let mut buf = alloc::vec![0u8; Self::SIZE];
                self.write_into(&mut buf, 0)?;
                Ok(buf)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self {
                    $(
                        $field: $crate::structs::binary_struct!(@init $ty $(, $init, $value)?),
                    )*
                }
            }
        }
    };

    (@check $self:ident, $name:ident, $field:ident, $ty:ty) => {};
    (@check $self:ident, $name:ident, $field:ident, $ty:ty, default, $value:expr) => {};
    (@check $self:ident, $name:ident, $field:ident, $ty:ty, constant, $value:expr) => {{
        let expected: $ty = $value;
        if $self.$field != expected {
            return Err($crate::structs::constant_mismatch(
                stringify!($name),
                stringify!($field),
                &expected,
                &$self.$field,
            ));
        }
    }};

    (@init $ty:ty) => {
        <$ty as $crate::structs::StructField>::zeroed()
    };
    (@init $ty:ty, $kind:ident, $value:expr) => {
        $value
    };
}

pub(crate) use binary_struct;

/// Declares a `u8` type code with named values, keeping unnamed values in an `Other` variant.
macro_rules! raw_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident = $value:literal),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis enum $name {
            $($variant,)*
            Other(u8),
        }

        impl From<u8> for $name {
            fn from(value: u8) -> Self {
                match value {
                    $($value => $name::$variant,)*
                    other => $name::Other(other),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                match value {
                    $($name::$variant => $value,)*
                    $name::Other(other) => other,
                }
            }
        }

        impl $name {
            pub fn name(&self) -> Option<&'static str> {
                match self {
                    $($name::$variant => Some(stringify!($variant)),)*
                    $name::Other(_) => None,
                }
            }
        }
    };
}

pub(crate) use raw_enum;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    binary_struct! {
        struct Sample: LE {
            magic: u32 = constant(0x0FF0_A55A),
            size: U24,
            kind: u8 = default(0x19),
            name: efi::Guid,
            wide: u64,
        }
    }

    binary_struct! {
        struct BigSample: BE {
            value: u16,
            small: U24,
        }
    }

    #[test]
    fn size_is_the_sum_of_field_widths() {
        assert_eq!(Sample::SIZE, 4 + 3 + 1 + 16 + 8);
        assert_eq!(BigSample::SIZE, 5);
    }

    #[test]
    fn default_applies_constants_and_defaults() {
        let sample = Sample::default();
        assert_eq!(sample.magic, 0x0FF0_A55A);
        assert_eq!(sample.kind, 0x19);
        assert_eq!(sample.size, U24(0));
        let bytes = sample.to_bytes().unwrap();
        assert_eq!(&bytes[..4], &[0x5A, 0xA5, 0xF0, 0x0F]);
        assert_eq!(Sample::parse(&bytes, 0).unwrap(), sample);
    }

    #[test]
    fn parse_reads_at_offset() {
        let mut buf = [0xFFu8; 40];
        let sample =
            Sample { size: U24(0x123456), name: guid::FFS2, wide: 0x1122_3344_5566_7788, ..Default::default() };
        sample.write_into(&mut buf, 4).unwrap();
        assert_eq!(&buf[8..11], &[0x56, 0x34, 0x12]);
        assert_eq!(Sample::parse(&buf, 4).unwrap(), sample);
    }

    #[test]
    fn short_buffers_are_invalid_data() {
        let bytes = Sample::default().to_bytes().unwrap();
        let err = Sample::parse(&bytes[..Sample::SIZE - 1], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(Sample::validate(&bytes, 1).is_err());
        assert!(Sample::validate(&bytes, usize::MAX).is_err());
    }

    #[test]
    fn constant_mismatch_is_reported() {
        let mut bytes = Sample::default().to_bytes().unwrap();
        bytes[0] ^= 0xFF;
        let err = Sample::validate(&bytes, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert_eq!(err.message(), "constant Sample.magic was not valid, expected 0xff0a55a and got 0xff0a5a5");
    }

    #[test]
    fn big_endian_fields() {
        let value = BigSample { value: 0x1234, small: U24(0xABCDEF) };
        let bytes = value.to_bytes().unwrap();
        assert_eq!(bytes, [0x12, 0x34, 0xAB, 0xCD, 0xEF]);
        assert_eq!(BigSample::parse(&bytes, 0).unwrap(), value);
    }

    #[test]
    fn oversized_u24_is_rejected() {
        let value = BigSample { value: 0, small: U24(0x0100_0000) };
        assert_eq!(value.to_bytes().unwrap_err().kind(), ErrorKind::InvalidData);
    }
}
