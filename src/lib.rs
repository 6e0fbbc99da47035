//! Maps fixed-address regions at `2^i`, optionally forks, then writes and verifies a
//! per-process byte pattern in every region, to observe how `mmap(2)` flags and `fork(2)`
//! interact: copy-on-write divergence for private mappings, mutual visibility for shared ones.
#![warn(rust_2018_idioms)]
#![deny(
    //missing_docs,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
)]

mod aspace;
mod config;
mod error;
pub mod logger;
mod pagemap;
mod pattern;
mod probe;
mod table;

pub use aspace::{AddressSpace, Fork, Native};
pub use config::{MapMode, MappingConfig, Verbosity, USAGE};
pub use error::{ProbeError, Result};
pub use pagemap::{page_size, PageMap, PageMapEntry};
pub use pattern::{verify, write_all, Mismatch, WritePattern};
pub use probe::{run, Report};
pub use table::{address_of, MappingHandle, MappingTable};
