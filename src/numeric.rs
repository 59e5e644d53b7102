//! Tagged numeric-kind descriptor and the one generic dispatch mechanism
//! shared by every streaming algorithm in this crate.
//!
//! Samples are stored on disk in one of ten representations (8/16/32/64-bit
//! signed/unsigned integers, 32/64-bit floats). Instead of duplicating a
//! ten-way branching ladder in the merge, acceleration, isosurface and
//! expression paths, each of them instantiates a generic function through
//! [`dispatch_kind!`].

use crate::error::{ConvertError, Result};

use std::fmt;

/// Describes how one sample component is stored: bit width, signedness and
/// float-ness. Unsigned floating point is an illegal combination and is
/// rejected at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NumericKind {
    bit_width: u8,
    signed: bool,
    is_float: bool,
}

impl NumericKind {
    pub const U8: NumericKind = NumericKind { bit_width: 8, signed: false, is_float: false };
    pub const I8: NumericKind = NumericKind { bit_width: 8, signed: true, is_float: false };
    pub const U16: NumericKind = NumericKind { bit_width: 16, signed: false, is_float: false };
    pub const I16: NumericKind = NumericKind { bit_width: 16, signed: true, is_float: false };
    pub const U32: NumericKind = NumericKind { bit_width: 32, signed: false, is_float: false };
    pub const I32: NumericKind = NumericKind { bit_width: 32, signed: true, is_float: false };
    pub const U64: NumericKind = NumericKind { bit_width: 64, signed: false, is_float: false };
    pub const I64: NumericKind = NumericKind { bit_width: 64, signed: true, is_float: false };
    pub const F32: NumericKind = NumericKind { bit_width: 32, signed: true, is_float: true };
    pub const F64: NumericKind = NumericKind { bit_width: 64, signed: true, is_float: true };

    /// Build a kind from its raw description.
    ///
    /// # Errors
    ///
    /// Returns [`ConvertError::Incompatible`] for bit widths outside
    /// {8, 16, 32, 64}, for unsigned float data, and for float widths other
    /// than 32 or 64.
    pub fn new(bit_width: u8, signed: bool, is_float: bool) -> Result<Self> {
        if !matches!(bit_width, 8 | 16 | 32 | 64) {
            return Err(ConvertError::Incompatible(format!(
                "invalid sample bit width {bit_width}"
            )));
        }
        if is_float && !signed {
            return Err(ConvertError::Incompatible(
                "unsigned floating point data is not a thing".into(),
            ));
        }
        if is_float && bit_width < 32 {
            return Err(ConvertError::Incompatible(format!(
                "no {bit_width}-bit float representation"
            )));
        }
        Ok(NumericKind { bit_width, signed, is_float })
    }

    pub fn bit_width(&self) -> u8 {
        self.bit_width
    }

    pub fn byte_width(&self) -> usize {
        usize::from(self.bit_width) / 8
    }

    pub fn is_signed(&self) -> bool {
        self.signed
    }

    pub fn is_float(&self) -> bool {
        self.is_float
    }

    /// The pointwise-widest kind covering both inputs: maximum bit width,
    /// OR of float-ness, OR of signed-ness.
    pub fn widest(self, other: NumericKind) -> NumericKind {
        NumericKind {
            bit_width: self.bit_width.max(other.bit_width),
            signed: self.signed || other.signed,
            is_float: self.is_float || other.is_float,
        }
    }
}

impl fmt::Display for NumericKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_float {
            "f"
        } else if self.signed {
            "i"
        } else {
            "u"
        };
        write!(f, "{prefix}{}", self.bit_width)
    }
}

/// One storable sample type. The trait carries just enough to let the
/// generic algorithms reinterpret byte buffers, compare, and round-trip
/// through `f64` arithmetic.
pub trait Sample: bytemuck::Pod + PartialOrd + Copy + Send + 'static {
    const KIND: NumericKind;
    /// Largest representable value, as f64. Used as the ceiling when
    /// rescaling data into this type's full range.
    const MAX_F64: f64;
    /// Smallest representable value, as f64.
    const MIN_F64: f64;

    fn to_f64(self) -> f64;
    /// Convert back from f64 arithmetic, clamping to the representable
    /// range for integer types.
    fn from_f64(v: f64) -> Self;
}

macro_rules! impl_int_sample {
    ($($t:ty => $kind:expr),+ $(,)?) => {$(
        impl Sample for $t {
            const KIND: NumericKind = $kind;
            const MAX_F64: f64 = <$t>::MAX as f64;
            const MIN_F64: f64 = <$t>::MIN as f64;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn from_f64(v: f64) -> Self {
                v.clamp(<$t>::MIN as f64, <$t>::MAX as f64) as $t
            }
        }
    )+};
}

impl_int_sample!(
    u8 => NumericKind::U8,
    i8 => NumericKind::I8,
    u16 => NumericKind::U16,
    i16 => NumericKind::I16,
    u32 => NumericKind::U32,
    i32 => NumericKind::I32,
    u64 => NumericKind::U64,
    i64 => NumericKind::I64,
);

impl Sample for f32 {
    const KIND: NumericKind = NumericKind::F32;
    const MAX_F64: f64 = f32::MAX as f64;
    const MIN_F64: f64 = f32::MIN as f64;

    fn to_f64(self) -> f64 {
        f64::from(self)
    }

    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl Sample for f64 {
    const KIND: NumericKind = NumericKind::F64;
    const MAX_F64: f64 = f64::MAX;
    const MIN_F64: f64 = f64::MIN;

    fn to_f64(self) -> f64 {
        self
    }

    fn from_f64(v: f64) -> Self {
        v
    }
}

/// Instantiate a generic block of code for the concrete sample type named
/// by a [`NumericKind`] at runtime.
///
/// ```ignore
/// let minmax = dispatch_kind!(kind, T => { typed_minmax::<T>(&bytes) });
/// ```
///
/// The expression form returns a crate [`Result`]; the unreachable unsigned
/// float and sub-32-bit float combinations surface as
/// [`ConvertError::Unsupported`](crate::error::ConvertError) rather than a
/// panic, since kinds read from foreign files pass through here.
#[macro_export]
macro_rules! dispatch_kind {
    ($kind:expr, $T:ident => $body:block) => {{
        let kind: $crate::numeric::NumericKind = $kind;
        match (kind.is_float(), kind.is_signed(), kind.bit_width()) {
            (true, true, 32) => {
                type $T = f32;
                $crate::error::Result::Ok($body)
            }
            (true, true, 64) => {
                type $T = f64;
                $crate::error::Result::Ok($body)
            }
            (false, true, 8) => {
                type $T = i8;
                $crate::error::Result::Ok($body)
            }
            (false, true, 16) => {
                type $T = i16;
                $crate::error::Result::Ok($body)
            }
            (false, true, 32) => {
                type $T = i32;
                $crate::error::Result::Ok($body)
            }
            (false, true, 64) => {
                type $T = i64;
                $crate::error::Result::Ok($body)
            }
            (false, false, 8) => {
                type $T = u8;
                $crate::error::Result::Ok($body)
            }
            (false, false, 16) => {
                type $T = u16;
                $crate::error::Result::Ok($body)
            }
            (false, false, 32) => {
                type $T = u32;
                $crate::error::Result::Ok($body)
            }
            (false, false, 64) => {
                type $T = u64;
                $crate::error::Result::Ok($body)
            }
            _ => $crate::error::Result::Err($crate::error::ConvertError::Unsupported {
                operation: "sample dispatch",
                kind,
            }),
        }
    }};
}

/// Swap the byte order of every sample in place. `width` is the per-sample
/// byte width; the buffer length must be a multiple of it.
pub fn swap_endian_in_place(bytes: &mut [u8], width: usize) {
    debug_assert_eq!(bytes.len() % width, 0);
    if width <= 1 {
        return;
    }
    for sample in bytes.chunks_exact_mut(width) {
        sample.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsigned_float() {
        assert!(NumericKind::new(32, false, true).is_err());
        assert!(NumericKind::new(64, false, true).is_err());
    }

    #[test]
    fn rejects_odd_widths() {
        assert!(NumericKind::new(12, false, false).is_err());
        assert!(NumericKind::new(16, true, true).is_err());
    }

    #[test]
    fn widest_combines_pointwise() {
        let a = NumericKind::U8;
        let b = NumericKind::F32;
        let w = a.widest(b);
        assert_eq!(w, NumericKind::F32);

        let w = NumericKind::I16.widest(NumericKind::U32);
        assert_eq!(w.bit_width(), 32);
        assert!(w.is_signed());
        assert!(!w.is_float());
    }

    #[test]
    fn dispatch_reaches_every_kind() {
        for kind in [
            NumericKind::U8,
            NumericKind::I8,
            NumericKind::U16,
            NumericKind::I16,
            NumericKind::U32,
            NumericKind::I32,
            NumericKind::U64,
            NumericKind::I64,
            NumericKind::F32,
            NumericKind::F64,
        ] {
            let byte_width = dispatch_kind!(kind, T => { std::mem::size_of::<T>() }).unwrap();
            assert_eq!(byte_width, kind.byte_width());
        }
    }

    #[test]
    fn from_f64_clamps_integers() {
        assert_eq!(u8::from_f64(300.0), 255);
        assert_eq!(u8::from_f64(-4.0), 0);
        assert_eq!(i16::from_f64(1e9), i16::MAX);
    }

    #[test]
    fn endian_swap_round_trips() {
        let mut buf = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        swap_endian_in_place(&mut buf, 4);
        assert_eq!(buf, [4, 3, 2, 1, 8, 7, 6, 5]);
        swap_endian_in_place(&mut buf, 4);
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
