use thiserror::Error;

/// The error type for all fatal pipeline failures.
///
/// Only conditions that abort the run are represented here. Per-accessor and
/// per-record failures (pattern mismatch, out-of-bounds slice, invalid
/// UTF-8, malformed lookup-table record) are counted in the
/// [`PipelineReport`](crate::PipelineReport) and never escalate.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem I/O failure.
    #[error("{0}")]
    Io(#[from] std::io::Error),

    /// The input module could not be loaded or parsed.
    #[error("failed to load module: {0}")]
    Load(#[source] dotscope::Error),

    /// The decoder type was located but its payload bytes are unreachable.
    #[error("payload extraction failed: {0}")]
    Payload(String),

    /// A method body slated for patching could not be re-read from the image.
    #[error("method body at RVA 0x{rva:08x} is malformed: {message}")]
    Body {
        /// RVA of the offending method body.
        rva: u32,
        /// What went wrong while re-reading or patching it.
        message: String,
    },

    /// The patched module could not be generated or written.
    #[error("failed to write module: {0}")]
    Write(#[source] dotscope::Error),

    /// Any other metadata-level failure from the underlying library.
    #[error("{0}")]
    Metadata(#[from] dotscope::Error),
}
