//! Error plumbing shared by the heap management crates.
//!
//! Every recoverable error in the workspace is a [`snafu`] enum whose variants
//! carry an implicit [`Location`], so that a failure reported from deep inside
//! the allocator still points at the line that produced it. [`Report`] renders
//! such an error together with its chain of sources, one cause per line.
//!
//! ```
//! use snafu::Snafu;
//! use snafu_utils::{Location, Report};
//!
//! #[derive(Debug, Snafu)]
//! #[snafu(display("region exhausted"))]
//! struct Exhausted {
//!     #[snafu(implicit)]
//!     location: Location,
//! }
//!
//! let report = Report::new(ExhaustedSnafu.build());
//! assert_eq!(report.to_string(), "region exhausted");
//! ```

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use core::{error::Error, fmt, panic};

use snafu::GenerateImplicitData;

/// Source location captured when an error value is built.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Location(&'static panic::Location<'static>);

impl Default for Location {
    #[track_caller]
    fn default() -> Self {
        Self(panic::Location::caller())
    }
}

impl GenerateImplicitData for Location {
    #[track_caller]
    fn generate() -> Self {
        Self::default()
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Multi-line rendering of an error and its sources.
///
/// The first line is the error itself; each source follows on its own
/// numbered line below a `Caused by:` heading.
pub struct Report<E> {
    error: E,
}

impl<E> fmt::Debug for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl<E> fmt::Display for Report<E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        let mut source = self.error.source();
        if source.is_some() {
            write!(f, "\n\nCaused by:")?;
        }
        let mut index = 0;
        while let Some(s) = source {
            write!(f, "\n{index:4}: {s}")?;
            source = s.source();
            index += 1;
        }
        Ok(())
    }
}

impl<E> Report<E> {
    pub fn new(error: E) -> Self {
        Self { error }
    }
}
