//! Epoch: the overloaded 64-bit identifier used as ballot number, instance
//! index, acceptor id and accepted-value id.

use std::fmt;

use crate::utils::{ErrorKind, VeelaError};

use serde::{Deserialize, Serialize};

/// Monotonically-assignable 64-bit identifier. Zero is reserved as the null
/// epoch. 2^64 instances at 10^8 per second last ~5849 years, so wrapping is
/// treated as a fatal defect.
#[derive(
    Debug,
    Default,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    /// The reserved null epoch.
    pub const NULL: Epoch = Epoch(0);

    #[inline]
    pub const fn new(u: u64) -> Self {
        Epoch(u)
    }

    #[inline]
    pub fn to_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn set_from_u64(&mut self, u: u64) {
        self.0 = u;
    }

    #[inline]
    pub fn set_from_epoch(&mut self, from: Epoch) {
        *self = from;
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Increments by one, failing with `ErrorKind::Overflow` on wraparound.
    pub fn checked_incr1(&mut self) -> Result<(), VeelaError> {
        match self.0.checked_add(1) {
            Some(u) => {
                self.0 = u;
                Ok(())
            }
            None => Err(VeelaError::new(
                ErrorKind::Overflow,
                format!("epoch {} overflows on increment", self.0),
            )),
        }
    }

    /// Increments by one. Panics on wraparound to zero.
    pub fn incr1(&mut self) {
        if let Err(e) = self.checked_incr1() {
            panic!("{}", e);
        }
    }

    /// Returns `self + n`, or `None` if that would overflow.
    #[inline]
    pub fn checked_add(self, n: u64) -> Option<Epoch> {
        self.0.checked_add(n).map(Epoch)
    }

    /// Returns `self + n`. Panics on overflow.
    pub fn add_assert(self, n: u64) -> Epoch {
        match self.checked_add(n) {
            Some(e) => e,
            None => panic!("epoch {} + {} overflows", self.0, n),
        }
    }
}

impl From<u64> for Epoch {
    fn from(u: u64) -> Self {
        Epoch(u)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
