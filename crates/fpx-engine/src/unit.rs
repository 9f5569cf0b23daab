//! Execution of one unit of a request against one backing store.

use crate::device::DeviceInner;
use crate::tracker::Tracker;
use fpx_backing::BackingTarget;
use fpx_error::{FpxError, Result};
use fpx_types::BioOp;
use tracing::debug;

/// Where a unit runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnitPath {
    /// File worker pool: writes go through background flush coordination.
    Worker,
    /// Block submission thread.
    Block,
}

impl DeviceInner {
    pub(crate) fn execute_unit(&self, unit: &Tracker, path: UnitPath) -> Result<()> {
        unit.check_live();
        let head_tracker;
        let head = if unit.is_head() {
            unit.head_state()
        } else {
            head_tracker = self.arena.get(unit.head_id());
            head_tracker.head_state()
        };
        let target = unit.handle().target().as_ref();
        let header = head.header;
        let offset = header.offset.0;
        // Operation counters belong to the request, so only the head counts.
        let account = unit.is_head();

        match header.op {
            BioOp::Read => read_segments(target, offset, &mut head.segments.write()),
            BioOp::Write => {
                if header.flags.preflush {
                    self.flush.flush(target, account)?;
                }
                if path == UnitPath::Worker {
                    self.flush.before_write(target);
                }
                let segments = head.segments.read();
                write_segments(target, offset, &segments)?;
                if path == UnitPath::Worker {
                    self.flush.record_writes(segments.len() as u64);
                }
                drop(segments);
                if header.flags.fua {
                    self.flush.flush(target, account)?;
                }
                Ok(())
            }
            BioOp::Flush => self.flush.flush(target, account),
            BioOp::Discard | BioOp::WriteZeroes => discard(target, offset, header.len),
        }
    }
}

/// Write every segment back to back from `offset`. Anything short of the
/// full segment is an error.
pub(crate) fn write_segments(
    target: &dyn BackingTarget,
    offset: u64,
    segments: &[Vec<u8>],
) -> Result<()> {
    let mut pos = offset;
    for segment in segments {
        let written = target.write_at(pos, segment)?;
        if written != segment.len() {
            return Err(FpxError::ShortTransfer {
                op: "write",
                offset: pos,
                expected: segment.len(),
                actual: written,
            });
        }
        pos += segment.len() as u64;
    }
    Ok(())
}

/// Fill every segment from `offset`. Reading past the end of the store is
/// not an error: whatever was not read is zeroed.
pub(crate) fn read_segments(
    target: &dyn BackingTarget,
    offset: u64,
    segments: &mut [Vec<u8>],
) -> Result<()> {
    let mut pos = offset;
    let mut segments = segments.iter_mut();
    while let Some(segment) = segments.next() {
        let read = target.read_at(pos, segment)?;
        if read < segment.len() {
            segment[read..].fill(0);
            for rest in segments.by_ref() {
                rest.fill(0);
            }
            break;
        }
        pos += segment.len() as u64;
    }
    Ok(())
}

/// Deallocate the range. Stores that cannot punch holes treat the discard
/// as done.
pub(crate) fn discard(target: &dyn BackingTarget, offset: u64, len: u64) -> Result<()> {
    match target.punch_hole(offset, len) {
        Ok(()) => Ok(()),
        Err(err) if err.is_unsupported() => {
            debug!(target: "fpx::engine", offset, len, error = %err, "discard_unsupported");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
