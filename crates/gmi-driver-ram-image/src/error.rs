/// Error type for the RAM image driver.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An I/O error occurred.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The image is too small to contain a single page.
    #[error("Image too small")]
    ImageTooSmall,
}

impl From<Error> for gmi_core::GmiError {
    fn from(value: Error) -> Self {
        gmi_core::GmiError::Driver(value.into())
    }
}
