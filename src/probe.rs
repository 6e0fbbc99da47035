use std::io::Read;

use log::{debug, info};

use crate::{
    aspace::{AddressSpace, Fork},
    config::MappingConfig,
    error::{ProbeError, Result},
    pagemap::{PageMap, PageMapEntry},
    pattern::{self, Mismatch, WritePattern},
    table::MappingTable,
};

/// What one process instance observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// The PID of the reporting instance.
    pub pid: u32,
    /// Which side of the fork the instance ran on, if a fork took place.
    pub fork: Option<Fork>,
    /// The pattern this instance wrote.
    pub pattern: WritePattern,
    /// The number of regions mapped.
    pub mapped: usize,
    /// Every region that did not read back as `pattern`.
    pub mismatches: Vec<Mismatch>,
    /// The first page of every region, when requested.
    pub pages: Vec<(usize, PageMapEntry)>,
}

/// Run every stage for the given configuration: map, optionally fork, write, verify.
///
/// With forking enabled this returns twice, once in the parent and once in the child, each with
/// its own [`Report`]. Parent and child are not synchronized in any way.
///
/// # Errors
///
/// Any error before the fork point aborts the whole run; after it, an error only concerns the
/// instance that returns it. Mismatches are never errors.
pub fn run<A, R>(config: &MappingConfig, aspace: &mut A, confirm: &mut R) -> Result<Report>
where
    A: AddressSpace + ?Sized,
    R: Read + ?Sized,
{
    debug!(
        "mapping 2^[{}, {}) with {}, map_size={}, set_size={}",
        config.exponents().start,
        config.exponents().end,
        config.mode(),
        config.map_size(),
        config.set_size()
    );
    let table = MappingTable::map(aspace, config)?;

    let fork = if config.fork() {
        let side = aspace.fork().map_err(ProbeError::Fork)?;
        if let Fork::Parent(child) = side {
            debug!("forked child {}", child);
        }
        Some(side)
    } else {
        None
    };

    let pid = aspace.pid();
    info!("PID = {}", pid);
    let pattern = WritePattern::from_pid(pid);

    pattern::write_all(&table, config, pid, pattern, confirm)?;
    let mismatches = pattern::verify(&table, pid, pattern);

    let pages = if config.pagemap() && !table.is_empty() {
        report_pages(&table, pid)?
    } else {
        Vec::new()
    };

    Ok(Report {
        pid,
        fork,
        pattern,
        mapped: table.len(),
        mismatches,
        pages,
    })
}

fn report_pages(table: &MappingTable, pid: u32) -> Result<Vec<(usize, PageMapEntry)>> {
    let mut pm = PageMap::open()?;
    table
        .iter()
        .map(|handle| {
            let entry = pm.entry(handle.base())?;
            info!("PID = {}, {:#x} {}", pid, handle.base(), entry);
            Ok((handle.base(), entry))
        })
        .collect()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
