//! Accept value: the immutable payload voted on for one instance.
//!
//! Binary format, all integers big-endian:
//!
//! ```text
//! u32 version (= 0) | u64 id | u32 member_idxs_len | u32 body_len
//! | member_idxs bytes | body bytes
//! ```
//!
//! `member_idxs` is a sequence of `(u32 offset, u32 len)` descriptors, so its
//! encoding length is always a non-zero multiple of 8.

use std::fmt;

use super::{ElectionResult, Epoch};
use crate::utils::{ErrorKind, VeelaError};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Only supported format version.
const FORMAT_VERSION: u32 = 0;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 4 + 8 + 4 + 4;

/// Encoded size of one member descriptor.
const MEMBER_IDX_LEN: usize = 4 + 4;

/// Byte-range descriptor addressing a member inside a value's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemberIdx {
    pub offset: u32,
    pub len: u32,
}

/// Immutable accept value. The first member descriptor is reserved for an
/// embedded `ElectionResult`; an empty range there means none is embedded.
#[derive(Clone, PartialEq, Eq)]
pub struct AcceptValue {
    /// Id of accept value, unique inside one paxos instance.
    id: Epoch,
    member_idxs: Vec<MemberIdx>,
    body: Bytes,
}

impl AcceptValue {
    /// Builds a value from raw parts. Fails with `ErrorKind::Encoding` if no
    /// descriptor is given and with `ErrorKind::OutOfBounds` if any
    /// descriptor's range exceeds the body.
    pub fn new(
        id: Epoch,
        member_idxs: Vec<MemberIdx>,
        body: Bytes,
    ) -> Result<Self, VeelaError> {
        if member_idxs.is_empty() {
            return Err(VeelaError::new(
                ErrorKind::Encoding,
                "accept value must declare the election result slot",
            ));
        }
        for idx in &member_idxs {
            if idx.len > 0
                && idx.offset as usize + idx.len as usize > body.len()
            {
                return Err(VeelaError::new(
                    ErrorKind::OutOfBounds,
                    format!(
                        "member range [{}, +{}) exceeds body length {}",
                        idx.offset,
                        idx.len,
                        body.len()
                    ),
                ));
            }
        }
        Ok(AcceptValue {
            id,
            member_idxs,
            body,
        })
    }

    /// Lays out an optional election result in slot 0 followed by given
    /// members into a fresh body.
    pub fn compose(
        id: Epoch,
        election_result: Option<&ElectionResult>,
        members: &[&[u8]],
    ) -> Result<Self, VeelaError> {
        let mut body = BytesMut::new();
        let mut member_idxs = Vec::with_capacity(1 + members.len());
        let mut push = |body: &mut BytesMut, bs: &[u8]| -> Result<(), VeelaError> {
            let offset = u32::try_from(body.len());
            let len = u32::try_from(bs.len());
            match (offset, len) {
                (Ok(offset), Ok(len)) => {
                    member_idxs.push(MemberIdx { offset, len });
                    body.put_slice(bs);
                    Ok(())
                }
                _ => Err(VeelaError::new(
                    ErrorKind::Encoding,
                    "accept value body exceeds u32 range",
                )),
            }
        };

        match election_result {
            Some(er) => push(&mut body, &er.to_bytes()?)?,
            None => push(&mut body, &[])?,
        }
        for member in members {
            push(&mut body, member)?;
        }
        Self::new(id, member_idxs, body.freeze())
    }

    #[inline]
    pub fn id(&self) -> Epoch {
        self.id
    }

    #[inline]
    pub fn member_idxs(&self) -> &[MemberIdx] {
        &self.member_idxs
    }

    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Returns the exact byte sub-range addressed by `idx`, or `None` if the
    /// descriptor is empty. Panics if the descriptor lies outside the body,
    /// which means the value was built bypassing `new()`.
    pub fn get_member(&self, idx: MemberIdx) -> Option<Bytes> {
        if idx.len == 0 {
            return None;
        }
        let start = idx.offset as usize;
        let end = start + idx.len as usize;
        if end > self.body.len() {
            panic!(
                "member range [{}, {}) out of body length {}",
                start,
                end,
                self.body.len()
            );
        }
        Some(self.body.slice(start..end))
    }

    /// Decodes the election result embedded in slot 0, if any.
    pub fn election_result(&self) -> Result<Option<ElectionResult>, VeelaError> {
        match self.get_member(self.member_idxs[0]) {
            None => Ok(None),
            Some(bs) => Ok(Some(ElectionResult::from_bytes(&bs)?)),
        }
    }

    /// Encodes into the versioned binary format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VeelaError> {
        if self.member_idxs.is_empty() {
            return Err(VeelaError::new(
                ErrorKind::Encoding,
                "empty member index encoding",
            ));
        }
        let idxs_len = self.member_idxs.len() * MEMBER_IDX_LEN;
        let (Ok(idxs_len_u32), Ok(body_len_u32)) =
            (u32::try_from(idxs_len), u32::try_from(self.body.len()))
        else {
            return Err(VeelaError::new(
                ErrorKind::Encoding,
                "accept value exceeds u32 length fields",
            ));
        };

        let mut buf =
            Vec::with_capacity(HEADER_LEN + idxs_len + self.body.len());
        buf.put_u32(FORMAT_VERSION);
        buf.put_u64(self.id.to_u64());
        buf.put_u32(idxs_len_u32);
        buf.put_u32(body_len_u32);
        for idx in &self.member_idxs {
            buf.put_u32(idx.offset);
            buf.put_u32(idx.len);
        }
        buf.put_slice(&self.body);
        debug_assert_eq!(buf.len(), HEADER_LEN + idxs_len + self.body.len());
        Ok(buf)
    }

    /// Decodes from the versioned binary format, validating every length
    /// and descriptor range.
    pub fn from_bytes(mut bs: &[u8]) -> Result<Self, VeelaError> {
        if bs.len() < HEADER_LEN {
            return Err(VeelaError::new(
                ErrorKind::TruncatedInput,
                format!("accept value too short: {} bytes", bs.len()),
            ));
        }
        let version = bs.get_u32();
        if version != FORMAT_VERSION {
            return Err(VeelaError::new(
                ErrorKind::UnsupportedVersion,
                format!("unsupported accept value version {}", version),
            ));
        }
        let id = Epoch::new(bs.get_u64());
        let idxs_len = bs.get_u32() as usize;
        let body_len = bs.get_u32() as usize;

        if idxs_len > bs.remaining() {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                "member index length out of bound",
            ));
        }
        if idxs_len == 0 || idxs_len % MEMBER_IDX_LEN != 0 {
            return Err(VeelaError::new(
                ErrorKind::Encoding,
                format!("malformed member index encoding of {} bytes", idxs_len),
            ));
        }
        let mut idxs_bs = &bs[..idxs_len];
        bs.advance(idxs_len);
        let mut member_idxs = Vec::with_capacity(idxs_len / MEMBER_IDX_LEN);
        while idxs_bs.has_remaining() {
            member_idxs.push(MemberIdx {
                offset: idxs_bs.get_u32(),
                len: idxs_bs.get_u32(),
            });
        }

        if body_len > bs.remaining() {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                "body length out of bound",
            ));
        }
        if body_len < bs.remaining() {
            return Err(VeelaError::new(
                ErrorKind::OutOfBounds,
                format!("{} unparsed trailing bytes", bs.remaining() - body_len),
            ));
        }
        Self::new(id, member_idxs, Bytes::copy_from_slice(bs))
    }
}

// Print body length rather than the whole body.
impl fmt::Debug for AcceptValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "AcceptValue{{id: {}, members: {}, body: {}B}}",
            self.id,
            self.member_idxs.len(),
            self.body.len()
        )
    }
}

// Persisted and transmitted in its own binary format.
impl Serialize for AcceptValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let bs = self.to_bytes().map_err(S::Error::custom)?;
        serializer.serialize_bytes(&bs)
    }
}

impl<'de> Deserialize<'de> for AcceptValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bs = Bytes::deserialize(deserializer)?;
        AcceptValue::from_bytes(&bs).map_err(D::Error::custom)
    }
}
