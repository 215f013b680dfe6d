//! Typed parameter packing for `Packed` events.
//!
//! Regular events spend 8 bytes per parameter. When a probe site records
//! many small values, packing them back to back cuts the trace size; the
//! reader recovers them with the same type list the writer used.
//!
//! ```
//! use litl::Packer;
//!
//! let mut p = Packer::new();
//! p.push(7u8);
//! p.push(-3i32);
//! p.push(1.5f64);
//! assert_eq!(p.bytes().len(), 13);
//! ```

use crate::types::MAX_DATA;

/// A value that can be serialized into a packed payload.
pub trait PackParam: Copy {
    /// Encoded width in bytes.
    const WIDTH: usize;

    /// Write the little-endian encoding into `out`, which is exactly
    /// `WIDTH` bytes.
    fn encode(self, out: &mut [u8]);
}

macro_rules! impl_pack_param {
    ($($ty:ty),*) => {
        $(impl PackParam for $ty {
            const WIDTH: usize = std::mem::size_of::<$ty>();

            #[inline]
            fn encode(self, out: &mut [u8]) {
                out.copy_from_slice(&self.to_le_bytes());
            }
        })*
    };
}

impl_pack_param!(u8, i8, u16, i16, u32, i32, u64, i64, f32, f64);

/// Fixed-capacity builder for a packed payload.
///
/// Capacity is [`MAX_DATA`] bytes, the most a single packed event can
/// carry. `push` refuses values that do not fit rather than splitting a
/// value across events.
#[derive(Clone, Copy)]
pub struct Packer {
    buf: [u8; MAX_DATA],
    len: usize,
}

impl Packer {
    pub fn new() -> Self {
        Self {
            buf: [0; MAX_DATA],
            len: 0,
        }
    }

    /// Append one value. Returns `false`, leaving the payload untouched,
    /// if the value would overflow the event.
    pub fn push<T: PackParam>(&mut self, value: T) -> bool {
        if self.len + T::WIDTH > MAX_DATA {
            log::warn!(
                "packed payload full: dropping {}-byte parameter at offset {}",
                T::WIDTH,
                self.len
            );
            return false;
        }
        value.encode(&mut self.buf[self.len..self.len + T::WIDTH]);
        self.len += T::WIDTH;
        true
    }

    /// The payload built so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Empty the builder for reuse at the next probe site.
    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for Packer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_typed_values_back_to_back() {
        let mut p = Packer::new();
        for v in [1i32, 3, 5, 7, 11, 13] {
            assert!(p.push(v));
        }
        assert_eq!(p.len(), 24);
        let bytes = p.bytes();
        for (i, v) in [1i32, 3, 5, 7, 11, 13].into_iter().enumerate() {
            let got = i32::from_le_bytes(bytes[i * 4..i * 4 + 4].try_into().unwrap());
            assert_eq!(got, v);
        }
    }

    #[test]
    fn mixed_widths() {
        let mut p = Packer::new();
        p.push(0xABu8);
        p.push(-2i16);
        p.push(u64::MAX);
        p.push(2.25f32);
        assert_eq!(p.len(), 1 + 2 + 8 + 4);
        assert_eq!(p.bytes()[0], 0xAB);
        let f = f32::from_le_bytes(p.bytes()[11..15].try_into().unwrap());
        assert_eq!(f, 2.25);
    }

    #[test]
    fn refuses_overflow() {
        let mut p = Packer::new();
        for _ in 0..10 {
            assert!(p.push(0u64));
        }
        assert_eq!(p.len(), MAX_DATA);
        assert!(!p.push(1u8));
        assert_eq!(p.len(), MAX_DATA);

        p.clear();
        assert!(p.is_empty());
        assert!(p.push(1u8));
    }
}
