//! Block requests as seen by the engine.

use fpx_error::BioStatus;
use fpx_types::{BioFlags, BioOp, ByteOffset};
use std::fmt;

/// Terminal callback of a request. Invoked exactly once.
pub type EndIo = Box<dyn FnOnce(BioCompletion) + Send + 'static>;

/// What a request's callback receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BioCompletion {
    pub status: BioStatus,
    /// The request's segments; for reads, filled with the data read.
    pub segments: Vec<Vec<u8>>,
}

/// Operation header shared by every unit of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BioHeader {
    pub op: BioOp,
    pub offset: ByteOffset,
    pub len: u64,
    pub flags: BioFlags,
}

/// A block request with its data segments and terminal callback.
pub struct Bio {
    header: BioHeader,
    segments: Vec<Vec<u8>>,
    end_io: EndIo,
}

impl Bio {
    /// Read into buffers of the given sizes, starting at `offset`.
    pub fn read(
        offset: u64,
        segment_lens: &[usize],
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        let segments: Vec<Vec<u8>> = segment_lens.iter().map(|&n| vec![0_u8; n]).collect();
        Self::with_segments(BioOp::Read, offset, BioFlags::NONE, segments, end_io)
    }

    /// Write `segments` back to back starting at `offset`.
    pub fn write(
        offset: u64,
        segments: Vec<Vec<u8>>,
        flags: BioFlags,
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        Self::with_segments(BioOp::Write, offset, flags, segments, end_io)
    }

    /// Flush the write cache of every replica.
    pub fn flush(end_io: impl FnOnce(BioCompletion) + Send + 'static) -> Self {
        Self::ranged(BioOp::Flush, 0, 0, end_io)
    }

    pub fn discard(
        offset: u64,
        len: u64,
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        Self::ranged(BioOp::Discard, offset, len, end_io)
    }

    pub fn write_zeroes(
        offset: u64,
        len: u64,
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        Self::ranged(BioOp::WriteZeroes, offset, len, end_io)
    }

    fn with_segments(
        op: BioOp,
        offset: u64,
        flags: BioFlags,
        segments: Vec<Vec<u8>>,
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        let len = segments.iter().map(|s| s.len() as u64).sum();
        Self {
            header: BioHeader {
                op,
                offset: ByteOffset(offset),
                len,
                flags,
            },
            segments,
            end_io: Box::new(end_io),
        }
    }

    fn ranged(
        op: BioOp,
        offset: u64,
        len: u64,
        end_io: impl FnOnce(BioCompletion) + Send + 'static,
    ) -> Self {
        Self {
            header: BioHeader {
                op,
                offset: ByteOffset(offset),
                len,
                flags: BioFlags::NONE,
            },
            segments: Vec::new(),
            end_io: Box::new(end_io),
        }
    }

    #[must_use]
    pub fn op(&self) -> BioOp {
        self.header.op
    }

    #[must_use]
    pub fn offset(&self) -> ByteOffset {
        self.header.offset
    }

    /// Length in bytes covered by the request.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.header.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.header.len == 0
    }

    #[must_use]
    pub fn flags(&self) -> BioFlags {
        self.header.flags
    }

    #[must_use]
    pub fn segments(&self) -> &[Vec<u8>] {
        &self.segments
    }

    /// Finish the request with `status`, handing its segments back.
    pub fn complete(self, status: BioStatus) {
        (self.end_io)(BioCompletion {
            status,
            segments: self.segments,
        });
    }

    pub(crate) fn into_parts(self) -> (BioHeader, Vec<Vec<u8>>, EndIo) {
        (self.header, self.segments, self.end_io)
    }

    pub(crate) fn from_parts(header: BioHeader, segments: Vec<Vec<u8>>, end_io: EndIo) -> Self {
        Self {
            header,
            segments,
            end_io,
        }
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.header.op)
            .field("offset", &self.header.offset.0)
            .field("len", &self.header.len)
            .field("flags", &self.header.flags)
            .field("segments", &self.segments.len())
            .finish_non_exhaustive()
    }
}
