use crate::AddressContext;

/// An error that can occur when working with a guest-memory image.
#[derive(thiserror::Error, Debug)]
pub enum GmiError {
    /// An error occurred in the image driver.
    #[error(transparent)]
    Driver(Box<dyn std::error::Error + Send + Sync>),

    /// An OS-specific error occurred.
    #[error(transparent)]
    Os(Box<dyn std::error::Error + Send + Sync>),

    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A translation error occurred.
    #[error("Translation error ({:?}, len: {})", .0[0], .0.len())]
    Translation(PageFaults),

    /// The requested range lies outside the image.
    #[error("Out of bounds")]
    OutOfBounds,

    /// The given address has invalid width.
    #[error("Invalid address width")]
    InvalidAddressWidth,

    /// The discovery pass was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// Other error.
    #[error("{0}")]
    Other(&'static str),
}

/// A collection of page faults.
pub type PageFaults = smallvec::SmallVec<[AddressContext; 1]>;

impl GmiError {
    /// Creates a new page fault error.
    pub fn page_fault(pf: impl Into<AddressContext>) -> Self {
        Self::Translation(smallvec::smallvec![pf.into()])
    }

    /// Checks whether this error is a recoverable read/translation miss.
    ///
    /// Misses are absorbed at their site; only driver, OS and I/O failures
    /// indicate something wrong with the image itself.
    pub fn is_miss(&self) -> bool {
        matches!(self, Self::Translation(_) | Self::OutOfBounds)
    }
}
