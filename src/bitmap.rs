use core::ptr::NonNull;

/// A bitmap stored in borrowed memory.
///
/// The map is byte-granular so that it can be placed at any address inside
/// an arena, regardless of alignment.
pub struct Bitmap {
    num_bits: usize,
    map: NonNull<u8>,
}

impl Bitmap {
    /// Returns the number of bytes needed to store `num_bits` bits.
    #[inline]
    pub const fn map_size(num_bits: usize) -> usize {
        num_bits / u8::BITS as usize + (num_bits % u8::BITS as usize != 0) as usize
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with every
    /// bit cleared.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for `Bitmap::map_size(num_bits)`
    ///   many bytes.
    /// - No other pointer may access those bytes while the bitmap exists.
    pub unsafe fn new(num_bits: usize, map: NonNull<u8>) -> Bitmap {
        assert!(num_bits > 0);

        unsafe { map.as_ptr().write_bytes(0, Self::map_size(num_bits)) };

        Bitmap { num_bits, map }
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe { self.map.as_ptr().add(byte_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let byte_ptr = self.map.as_ptr().add(byte_idx);
            let byte = byte_ptr.read();
            byte_ptr.write(match value {
                true => byte | mask,
                false => byte & !mask,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn with_bitmap(num_bits: usize, f: impl FnOnce(&mut Bitmap)) {
        let mut v = std::vec![0xFFu8; Bitmap::map_size(num_bits)];
        let map = NonNull::new(v.as_mut_ptr()).unwrap();
        let mut bitmap = unsafe { Bitmap::new(num_bits, map) };
        f(&mut bitmap);
    }

    #[test]
    fn map_size_rounds_up() {
        assert_eq!(Bitmap::map_size(1), 1);
        assert_eq!(Bitmap::map_size(8), 1);
        assert_eq!(Bitmap::map_size(9), 2);
        assert_eq!(Bitmap::map_size(31), 4);
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            with_bitmap(num_bits, |b| {
                assert!((0..num_bits).all(|i| !b.get(i)));
            });
        }
    }

    #[test]
    fn set_and_clear() {
        with_bitmap(20, |b| {
            b.set(0, true);
            b.set(9, true);
            b.set(19, true);

            assert!(b.get(0));
            assert!(!b.get(1));
            assert!(b.get(9));
            assert!(b.get(19));

            b.set(9, false);
            assert!(!b.get(9));
            assert!(b.get(0));
        });
    }
}
