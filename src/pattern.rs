use std::fmt;
use std::io::Read;

use log::{debug, info};

use crate::{
    config::MappingConfig,
    error::{ProbeError, Result},
    table::MappingTable,
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// WritePattern
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The byte a process writes into every region: its PID truncated to one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePattern(u8);

impl WritePattern {
    /// Derive the pattern of the process with the given `pid`.
    #[inline(always)]
    pub fn from_pid(pid: u32) -> Self {
        WritePattern(pid as u8)
    }

    #[inline(always)]
    pub fn byte(self) -> u8 {
        self.0
    }
}

impl fmt::Display for WritePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:02x}", self.0)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Mismatch
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A region whose first byte did not read back as the pattern this process wrote.
///
/// This is an observation, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// The PID of the process that observed the mismatch.
    pub pid: u32,
    /// The base address of the region.
    pub addr: usize,
    /// The byte that was read.
    pub observed: u8,
    /// The byte this process wrote.
    pub expected: WritePattern,
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID = {}, {:#x} read(0x{:02x}) != write_pattern({})",
            self.pid, self.addr, self.observed, self.expected
        )
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// write & verify
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Fill the first `set_size` bytes of every region with `pattern`, in table order.
///
/// In keystroke mode one byte is read from `confirm` before every write; end of input lets the
/// remaining writes proceed unattended.
///
/// # Errors
///
/// Only reading the confirmation can fail, with [`ProbeError::Keystroke`].
pub fn write_all<R>(
    table: &MappingTable,
    config: &MappingConfig,
    pid: u32,
    pattern: WritePattern,
    confirm: &mut R,
) -> Result<()>
where
    R: Read + ?Sized,
{
    let verbosity = config.verbosity();
    let mut key = [0u8; 1];
    for handle in table {
        if verbosity.keystroke() && confirm.read(&mut key).map_err(ProbeError::Keystroke)? == 0 {
            debug!("PID = {}, no more keystrokes, continuing unattended", pid);
        }
        // The AddressSpace contract keeps `handle.base()` mapped; `set_size` beyond `map_size`
        // is the caller's deliberate choice.
        unsafe { handle.fill(pattern.byte(), config.set_size()) };
        if verbosity.debug() {
            debug!("PID = {}, touched {:#x}", pid, handle.base());
        }
    }
    Ok(())
}

/// Read back the first byte of every region and report each one that differs from `pattern`.
pub fn verify(table: &MappingTable, pid: u32, pattern: WritePattern) -> Vec<Mismatch> {
    table
        .iter()
        .filter_map(|handle| {
            let observed = handle.first_byte();
            if observed == pattern.byte() {
                return None;
            }
            let mismatch = Mismatch {
                pid,
                addr: handle.base(),
                observed,
                expected: pattern,
            };
            info!("{}", mismatch);
            Some(mismatch)
        })
        .collect()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use crate::aspace::fake::FakeSpace;

    // The fake space owns the regions, so it has to outlive the table.
    fn setup(args: &[&str], pid: u32) -> anyhow::Result<(MappingConfig, MappingTable, FakeSpace)> {
        let config = MappingConfig::from_args(args.iter().copied())?;
        let mut aspace = FakeSpace::new(pid);
        let table = MappingTable::map(&mut aspace, &config)?;
        Ok((config, table, aspace))
    }

    #[test]
    fn test_pattern_is_truncated_pid() {
        assert_eq!(WritePattern::from_pid(0x1234).byte(), 0x34);
        assert_eq!(WritePattern::from_pid(255).byte(), 0xff);
        assert_eq!(WritePattern::from_pid(256).byte(), 0x00);
        assert_eq!(WritePattern::from_pid(0xab).to_string(), "0xab");
    }

    #[test]
    fn test_write_then_verify_reads_own_pattern() -> anyhow::Result<()> {
        let args = ["-a", "-p", "-b", "10", "-e", "14", "-m", "256", "-n", "256"];
        let (config, table, _aspace) = setup(&args, 0x42)?;
        let pattern = WritePattern::from_pid(0x42);
        write_all(&table, &config, 0x42, pattern, &mut io::empty())?;

        assert!(verify(&table, 0x42, pattern).is_empty());
        for handle in &table {
            let region = unsafe { std::slice::from_raw_parts(handle.base() as *const u8, 256) };
            assert!(region.iter().all(|&b| b == 0x42));
        }
        Ok(())
    }

    #[test]
    fn test_only_set_size_bytes_are_written() -> anyhow::Result<()> {
        let (config, table, _aspace) = setup(&["-b", "10", "-e", "11", "-m", "64", "-n", "16"], 9)?;
        write_all(&table, &config, 9, WritePattern::from_pid(9), &mut io::empty())?;

        let handle = table.get(0).unwrap();
        let region = unsafe { std::slice::from_raw_parts(handle.base() as *const u8, 64) };
        assert!(region[..16].iter().all(|&b| b == 9));
        assert!(region[16..].iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn test_mismatch_reports_foreign_byte() -> anyhow::Result<()> {
        let (config, table, _aspace) = setup(&["-b", "10", "-e", "13", "-m", "32", "-n", "32"], 1)?;
        write_all(&table, &config, 1, WritePattern::from_pid(1), &mut io::empty())?;

        // Another writer overwrites the second region.
        unsafe { table.get(1).unwrap().fill(0x77, 32) };

        let mismatches = verify(&table, 1, WritePattern::from_pid(1));
        assert_eq!(
            mismatches,
            vec![Mismatch {
                pid: 1,
                addr: table.get(1).unwrap().base(),
                observed: 0x77,
                expected: WritePattern(1),
            }]
        );
        assert!(mismatches[0].to_string().ends_with("read(0x77) != write_pattern(0x01)"));
        Ok(())
    }

    #[test]
    fn test_keystroke_reads_one_byte_per_write() -> anyhow::Result<()> {
        let (config, table, _aspace) = setup(&["-k", "-b", "10", "-e", "13", "-m", "8", "-n", "8"], 3)?;
        let mut input = io::Cursor::new(b"abcdef".to_vec());
        write_all(&table, &config, 3, WritePattern::from_pid(3), &mut input)?;
        assert_eq!(input.position(), 3);
        Ok(())
    }

    #[test]
    fn test_no_keystroke_reads_nothing() -> anyhow::Result<()> {
        let (config, table, _aspace) = setup(&["-d", "-b", "10", "-e", "13", "-m", "8", "-n", "8"], 3)?;
        let mut input = io::Cursor::new(b"abcdef".to_vec());
        write_all(&table, &config, 3, WritePattern::from_pid(3), &mut input)?;
        assert_eq!(input.position(), 0);
        Ok(())
    }
}
