use snafu::Snafu;
use snafu_utils::Location;
use vmem::VmError;

/// Recoverable heap failures.
///
/// Corruption of the block chains is never reported through this type: it
/// stops the offending call with a panic instead.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum HeapError {
    #[snafu(display("cannot allocate zero bytes"))]
    ZeroSize {
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("request of {requested} bytes cannot be represented as a block"))]
    SizeOverflow {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "growing the heap top {top:#x} by {increment:#x} bytes exceeds the reserved end {end:#x}"
    ))]
    OutOfReservedRange {
        increment: usize,
        top: usize,
        end: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("address {addr:#x} is not a block of this heap"))]
    NotInRegion {
        addr: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("invalid heap configuration: {reason}"))]
    InvalidConfig {
        reason: &'static str,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to create the heap area"))]
    CreateArea {
        #[snafu(implicit)]
        location: Location,
        source: VmError,
    },
}
