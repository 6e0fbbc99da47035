use std::io;

use thiserror::Error;

/// A custom `Result` type for this crate, combining a return value with a [`ProbeError`].
pub type Result<T> = std::result::Result<T, ProbeError>;

/// An error type returned by every stage of the probe.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// `-h`/`--help` was given.
    #[error("help requested")]
    Help,

    /// An unrecognized option or a malformed option argument.
    #[error("invalid usage: {0}")]
    Usage(String),

    /// `--check_bounds` is on and the write size exceeds the mapping size.
    #[error("set_size ({set_size}) exceeds map_size ({map_size})")]
    OutOfBounds {
        /// Bytes to be written per mapping.
        set_size: usize,
        /// Bytes per mapping.
        map_size: usize,
    },

    /// The mapping table could not be reserved.
    #[error("could not allocate a table for {0} mappings")]
    Alloc(usize),

    /// A fixed-address `mmap(2)` request was not satisfied.
    #[error("mmap of 2^{exponent} ({addr:#x}) failed: {source}")]
    Map {
        /// The exponent whose mapping failed.
        exponent: u32,
        /// The requested address.
        addr: usize,
        /// The underlying error.
        source: io::Error,
    },

    /// `2^exponent` does not fit in a pointer.
    #[error("2^{0} cannot be represented as an address on this platform")]
    Exponent(u32),

    /// `fork(2)` failed.
    #[error("fork failed: {0}")]
    Fork(#[source] io::Error),

    /// Reading the manual confirmation failed.
    #[error("could not read keystroke: {0}")]
    Keystroke(#[source] io::Error),

    /// Error opening a file.
    #[error("could not open '{path}': {source}")]
    Open {
        /// The path of the file that was attempted to be opened.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error reading from a file.
    #[error("could not read '{path}': {source}")]
    Read {
        /// The path of the file that was attempted to be read.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Error seeking in a file.
    #[error("could not seek in '{path}': {source}")]
    Seek {
        /// The path of the file that was attempted to be seeked.
        path: String,
        /// The underlying error.
        source: io::Error,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProbeError {
    /// The process exit status this error terminates the run with.
    ///
    /// Every error is a failure, including an explicit help request.
    pub fn exit_code(&self) -> i32 {
        libc::EXIT_FAILURE
    }
}
