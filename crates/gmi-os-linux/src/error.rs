/// Error types for Linux structure discovery.
#[derive(thiserror::Error, Debug)]
pub enum LinuxError {
    /// A caller-supplied kernel page directory failed structural validation
    /// and fallback to the heuristic scan was not permitted.
    #[error("Trusted kernel PGD rejected: {0}")]
    TrustedPgdRejected(&'static str),

    /// Corrupted struct.
    #[error("Corrupted struct: {0}")]
    CorruptedStruct(&'static str),
}

impl From<LinuxError> for gmi_core::GmiError {
    fn from(value: LinuxError) -> Self {
        gmi_core::GmiError::Os(value.into())
    }
}
