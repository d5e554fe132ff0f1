//! Bitmap data structure helper.

use std::fmt;

use crate::utils::{ErrorKind, VeelaError};

use fixedbitset::FixedBitSet;

/// Compact bitmap for membership position -> bool mapping. Positions are the
/// indices of acceptors inside an election result's member list.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap(FixedBitSet);

impl Bitmap {
    /// Creates a new all-false bitmap of given size.
    pub fn new(size: u8) -> Self {
        if size == 0 {
            panic!("invalid bitmap size {}", size);
        }
        Bitmap(FixedBitSet::with_capacity(size as usize))
    }

    /// Sets bit at index to given flag.
    #[inline]
    pub fn set(&mut self, idx: u8, flag: bool) -> Result<(), VeelaError> {
        if idx as usize >= self.0.len() {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!("index {} out of bound", idx),
            ));
        }
        self.0.set(idx as usize, flag);
        Ok(())
    }

    /// Gets the bit flag at index.
    #[inline]
    pub fn get(&self, idx: u8) -> Result<bool, VeelaError> {
        if idx as usize >= self.0.len() {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!("index {} out of bound", idx),
            ));
        }
        Ok(self.0[idx as usize])
    }

    #[inline]
    pub fn size(&self) -> u8 {
        self.0.len() as u8
    }

    /// Returns the number of trues in the bitmap.
    #[inline]
    pub fn count(&self) -> u8 {
        self.0.count_ones(..) as u8
    }
}

// Implement `Debug` trait manually for better trace printing.
impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let ones: Vec<usize> = self.0.ones().collect();
        write!(f, "{{{}; {:?}}}", self.size(), ones)
    }
}

#[cfg(test)]
mod bitmap_tests {
    use super::*;

    #[test]
    #[should_panic]
    fn bitmap_new_panic() {
        Bitmap::new(0);
    }

    #[test]
    fn bitmap_set_get() {
        let mut map = Bitmap::new(5);
        assert!(map.set(0, true).is_ok());
        assert!(map.set(1, false).is_ok());
        assert!(map.set(4, true).is_ok());
        assert!(map.set(5, true).is_err());
        assert_eq!(map.get(0), Ok(true));
        assert_eq!(map.get(1), Ok(false));
        assert_eq!(map.get(4), Ok(true));
        assert!(map.get(5).is_err());
    }

    #[test]
    fn bitmap_count() {
        let mut map = Bitmap::new(3);
        assert_eq!(map.count(), 0);
        map.set(2, true).unwrap();
        map.set(2, true).unwrap();
        map.set(0, true).unwrap();
        assert_eq!(map.count(), 2);
        assert_eq!(format!("{:?}", map), "{3; [0, 2]}");
    }
}
