//! End-to-end runs of the binary against the real kernel.
//!
//! The regions live at 2^33..2^37, well clear of where the loader, the heap and the stacks end
//! up on 64-bit Linux.

use std::collections::HashSet;
use std::process::{Command, Output, Stdio};

const RANGE: [&str; 4] = ["-b", "33", "-e", "37"];

fn probe(args: &[&str]) -> anyhow::Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_mmap-fork-probe"))
        .args(args)
        .stdin(Stdio::null())
        .output()?)
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn mapping_lines(out: &str) -> usize {
    out.lines().filter(|l| l.starts_with("i=")).count()
}

/// The PIDs announced right after the fork point.
fn pids(out: &str) -> Vec<u32> {
    out.lines()
        .filter_map(|l| l.strip_prefix("PID = "))
        .filter_map(|rest| rest.trim().parse().ok())
        .collect()
}

/// `(pid, addr, observed, expected)` for every mismatch line.
fn mismatches(out: &str) -> anyhow::Result<Vec<(u32, u64, u8, u8)>> {
    out.lines()
        .filter(|l| l.contains("!= write_pattern("))
        .map(|l| -> anyhow::Result<(u32, u64, u8, u8)> {
            let malformed = || anyhow::anyhow!("malformed line: {}", l);
            let (pid, rest) = l
                .strip_prefix("PID = ")
                .and_then(|rest| rest.split_once(", "))
                .ok_or_else(malformed)?;
            let pid: u32 = pid.parse()?;
            let addr = rest
                .split_whitespace()
                .next()
                .and_then(|a| a.strip_prefix("0x"))
                .ok_or_else(malformed)?;
            let addr = u64::from_str_radix(addr, 16)?;
            let hex = |tag: &str| -> anyhow::Result<u8> {
                let start = l.find(tag).ok_or_else(|| anyhow::anyhow!("no {} in {}", tag, l))?;
                let digits = &l[start + tag.len()..start + tag.len() + 2];
                Ok(u8::from_str_radix(digits, 16)?)
            };
            Ok((pid, addr, hex("read(0x")?, hex("write_pattern(0x")?))
        })
        .collect()
}

#[test]
fn test_help_maps_nothing() -> anyhow::Result<()> {
    for flag in &["-h", "--help"] {
        let out = probe(&["-a", "-p", *flag])?;
        assert_eq!(out.status.code(), Some(1));
        let text = stdout(&out);
        assert!(text.starts_with("Usage:"));
        assert_eq!(mapping_lines(&text), 0);
        assert!(pids(&text).is_empty());
    }
    Ok(())
}

#[test]
fn test_unrecognized_option_fails() -> anyhow::Result<()> {
    for args in &[&["-z"][..], &["--begin"], &["-b", "x"]] {
        let out = probe(args)?;
        assert_eq!(out.status.code(), Some(1), "{:?}", args);
        assert!(stdout(&out).starts_with("Usage:"));
    }
    Ok(())
}

#[test]
fn test_vacuous_range() -> anyhow::Result<()> {
    let out = probe(&["-d", "-a", "-p", "-b", "33", "-e", "33"])?;
    assert!(out.status.success());
    let text = stdout(&out);
    assert_eq!(mapping_lines(&text), 0);
    assert!(!text.contains("touched"));
    assert!(mismatches(&text)?.is_empty());
    Ok(())
}

#[test]
fn test_single_process_round_trip() -> anyhow::Result<()> {
    let mut args = vec!["-d", "-a", "-p"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert!(out.status.success(), "{:?}", out);

    let text = stdout(&out);
    assert_eq!(mapping_lines(&text), 4);
    for (i, line) in text.lines().filter(|l| l.starts_with("i=")).enumerate() {
        let addr = 1u64 << (33 + i);
        assert_eq!(line, format!("i={},addr={:#x},ptr={:#x}", 33 + i, addr, addr));
    }
    assert_eq!(pids(&text).len(), 1);
    assert_eq!(text.matches("touched").count(), 4);
    assert!(mismatches(&text)?.is_empty());
    Ok(())
}

#[test]
fn test_debug_off_hides_writes() -> anyhow::Result<()> {
    let mut args = vec!["-a", "-p", "-u"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert!(out.status.success());
    let text = stdout(&out);
    assert_eq!(mapping_lines(&text), 4);
    assert!(!text.contains("touched"));
    Ok(())
}

#[test]
fn test_mapping_failure_stops_the_run() -> anyhow::Result<()> {
    // Neither MAP_ANONYMOUS nor a file descriptor: the kernel refuses the very first request.
    let mut args = vec!["-d", "-f", "-p"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert_eq!(out.status.code(), Some(1));

    let text = stdout(&out);
    assert_eq!(mapping_lines(&text), 1);
    assert!(text.contains("ptr=MAP_FAILED"));
    assert!(pids(&text).is_empty());
    assert!(!text.contains("touched"));
    assert!(String::from_utf8_lossy(&out.stderr).contains("mmap of 2^33"));
    Ok(())
}

#[test]
fn test_bounds_check_is_opt_in() -> anyhow::Result<()> {
    let mut args = vec!["-a", "-p", "-m", "100", "-n", "4096"];
    args.extend_from_slice(&RANGE);
    // The kernel rounds the mapping up to a page, so the unchecked write stays in bounds.
    let out = probe(&args)?;
    assert!(out.status.success());

    args.push("-c");
    let out = probe(&args)?;
    assert_eq!(out.status.code(), Some(1));
    assert_eq!(mapping_lines(&stdout(&out)), 0);
    Ok(())
}

#[test]
fn test_fork_private_diverges() -> anyhow::Result<()> {
    let mut args = vec!["-f", "-d", "-a", "-p"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert!(out.status.success());

    let text = stdout(&out);
    // Mapping happens once, before the fork.
    assert_eq!(mapping_lines(&text), 4);
    let pids: HashSet<_> = pids(&text).into_iter().collect();
    assert_eq!(pids.len(), 2);
    assert_eq!(text.matches("touched").count(), 8);
    // Copy-on-write: each process only ever sees its own pattern.
    assert!(mismatches(&text)?.is_empty());
    Ok(())
}

#[test]
fn test_fork_shared_shows_the_other_writer() -> anyhow::Result<()> {
    let mut args = vec!["-f", "-a", "-s"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert!(out.status.success());

    let text = stdout(&out);
    let pids = pids(&text);
    assert_eq!(pids.len(), 2);
    // Whether any mismatch shows up depends on scheduling; every one that does must carry the
    // other process's pattern.
    let mapped: Vec<u64> = (33..37).map(|i| 1u64 << i).collect();
    for (pid, addr, observed, expected) in mismatches(&text)? {
        assert!(mapped.contains(&addr), "{:#x} was never mapped", addr);
        let other = pids.iter().find(|&&p| p != pid).copied().unwrap();
        assert_eq!(expected, pid as u8);
        assert_eq!(observed, other as u8);
    }
    Ok(())
}

#[test]
fn test_pagemap_report() -> anyhow::Result<()> {
    if std::fs::File::open("/proc/self/pagemap").is_err() {
        eprintln!("skipping: /proc/self/pagemap is not readable");
        return Ok(());
    }
    let mut args = vec!["-g", "-a", "-p"];
    args.extend_from_slice(&RANGE);
    let out = probe(&args)?;
    assert!(out.status.success());

    let text = stdout(&out);
    let pages: Vec<_> = text.lines().filter(|l| l.contains("present:")).collect();
    assert_eq!(pages.len(), 4);
    assert!(pages.iter().all(|l| l.contains("present: true")));
    Ok(())
}
