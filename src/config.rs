use std::fmt;
use std::ops::Range;

use bitflags::bitflags;
use log::warn;

use crate::error::{ProbeError, Result};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MapMode
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// The `flags` argument handed to `mmap(2)` for every region.
    pub struct MapMode: libc::c_int {
        /// Place the mapping at exactly the requested address.
        const FIXED     = libc::MAP_FIXED;
        /// Writes are visible to every process holding the mapping.
        const SHARED    = libc::MAP_SHARED;
        /// Copy-on-write mapping, private to the writer.
        const PRIVATE   = libc::MAP_PRIVATE;
        /// Not backed by any file.
        const ANONYMOUS = libc::MAP_ANONYMOUS;
        /// Prefault the page tables.
        const POPULATE  = libc::MAP_POPULATE;
    }
}

impl Default for MapMode {
    fn default() -> Self {
        MapMode::FIXED
    }
}

impl fmt::Display for MapMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::FIXED, "MAP_FIXED"),
            (Self::SHARED, "MAP_SHARED"),
            (Self::PRIVATE, "MAP_PRIVATE"),
            (Self::ANONYMOUS, "MAP_ANONYMOUS"),
            (Self::POPULATE, "MAP_POPULATE"),
        ];
        let set: Vec<_> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|&(_, name)| name)
            .collect();
        write!(f, "{}", set.join("|"))
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Verbosity
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// How much the pattern writer reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Mapping attempts, process identity and mismatches only.
    Quiet,
    /// Also report every write.
    Debug,
    /// Like [`Verbosity::Debug`], and wait for a keystroke before every write.
    Keystroke,
}

impl Default for Verbosity {
    fn default() -> Self {
        Verbosity::Quiet
    }
}

impl Verbosity {
    /// Returns `true` if every write is reported.
    #[inline(always)]
    pub fn debug(self) -> bool {
        self != Verbosity::Quiet
    }

    /// Returns `true` if every write waits for a manual confirmation.
    #[inline(always)]
    pub fn keystroke(self) -> bool {
        self == Verbosity::Keystroke
    }

    /// The `log` level filter matching this verbosity.
    pub fn level_filter(self) -> log::LevelFilter {
        if self.debug() {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MappingConfig
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Width of the user address space: every user address lies below `2^USER_VA_BITS`.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
const USER_VA_BITS: u32 = 47;
#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
const USER_VA_BITS: u32 = (std::mem::size_of::<usize>() * 8) as u32 - 1;

/// Returns `true` if a mapping at `2^exponent` cannot lie in the user address space.
#[inline(always)]
fn beyond_user_space(exponent: u32) -> bool {
    exponent >= USER_VA_BITS
}

/// The complete set of parameters for one run, fixed once resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingConfig {
    from: u32,
    till: u32,
    map_size: usize,
    set_size: usize,
    mode: MapMode,
    fork: bool,
    verbosity: Verbosity,
    check_bounds: bool,
    pagemap: bool,
}

impl Default for MappingConfig {
    fn default() -> Self {
        MappingConfig {
            from: 30,
            till: 39,
            map_size: 4096,
            set_size: 4096,
            mode: MapMode::default(),
            fork: false,
            verbosity: Verbosity::default(),
            check_bounds: false,
            pagemap: false,
        }
    }
}

impl MappingConfig {
    /// Resolve a configuration from command line arguments, without the program name.
    ///
    /// Returns [`ProbeError::Help`] as soon as `-h`/`--help` is seen, and [`ProbeError::Usage`]
    /// for anything unrecognized or malformed.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut config = MappingConfig::default();
        let mut args = args.into_iter().map(Into::into);

        while let Some(arg) = args.next() {
            if arg == "--" {
                if let Some(extra) = args.next() {
                    return Err(usage(format!("unexpected argument '{}'", extra)));
                }
                break;
            }
            if let Some(long) = arg.strip_prefix("--") {
                let (name, inline) = match long.split_once('=') {
                    Some((name, value)) => (name, Some(value.to_owned())),
                    None => (long, None),
                };
                let opt = Opt::from_long(name)
                    .ok_or_else(|| usage(format!("unrecognized option '--{}'", name)))?;
                let value = match (opt.takes_value(), inline) {
                    (true, Some(value)) => Some(value),
                    (true, None) => Some(args.next().ok_or_else(|| missing(opt))?),
                    (false, Some(_)) => {
                        return Err(usage(format!("option '--{}' takes no argument", name)))
                    }
                    (false, None) => None,
                };
                config.apply(opt, value.as_deref())?;
            } else if let Some(shorts) = arg.strip_prefix('-').filter(|s| !s.is_empty()) {
                for (i, c) in shorts.char_indices() {
                    let opt = Opt::from_short(c)
                        .ok_or_else(|| usage(format!("invalid option -- '{}'", c)))?;
                    if !opt.takes_value() {
                        config.apply(opt, None)?;
                        continue;
                    }
                    let attached = &shorts[i + c.len_utf8()..];
                    let value = if attached.is_empty() {
                        args.next().ok_or_else(|| missing(opt))?
                    } else {
                        attached.to_owned()
                    };
                    config.apply(opt, Some(&value))?;
                    break;
                }
            } else {
                return Err(usage(format!("unexpected argument '{}'", arg)));
            }
        }

        config.check()?;
        Ok(config)
    }

    fn apply(&mut self, opt: Opt, value: Option<&str>) -> Result<()> {
        match opt {
            Opt::Debug => {
                if !self.verbosity.keystroke() {
                    self.verbosity = Verbosity::Debug;
                }
            }
            Opt::Keystroke => self.verbosity = Verbosity::Keystroke,
            Opt::Help => return Err(ProbeError::Help),
            Opt::ForkChild => self.fork = true,
            Opt::Begin => self.from = number(opt, value)?,
            Opt::End => self.till = number(opt, value)?,
            Opt::MapSize => self.map_size = number(opt, value)?,
            Opt::SetSize => self.set_size = number(opt, value)?,
            Opt::MapPopulate => self.mode |= MapMode::POPULATE,
            Opt::MapAnonymous => self.mode |= MapMode::ANONYMOUS,
            Opt::MapShared => self.mode |= MapMode::SHARED,
            Opt::MapPrivate => self.mode |= MapMode::PRIVATE,
            Opt::CheckBounds => self.check_bounds = true,
            Opt::PageMap => self.pagemap = true,
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        if self.check_bounds && self.set_size > self.map_size {
            return Err(ProbeError::OutOfBounds {
                set_size: self.set_size,
                map_size: self.map_size,
            });
        }
        if let Some(last) = self.exponents().last() {
            if beyond_user_space(last) {
                warn!(
                    "2^{} lies beyond the {}-bit user address space; the kernel will likely refuse it",
                    last, USER_VA_BITS
                );
            }
        }
        Ok(())
    }

    /// The exponents `i` whose addresses `2^i` are mapped, in order.
    #[inline(always)]
    pub fn exponents(&self) -> Range<u32> {
        self.from..self.till
    }

    /// The number of mappings a run creates; zero if `end <= begin`.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.till.saturating_sub(self.from) as usize
    }

    /// Returns `true` if the exponent range is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes per mapping.
    #[inline(always)]
    pub fn map_size(&self) -> usize {
        self.map_size
    }

    /// Bytes written per mapping. Not bounded by [`Self::map_size`] unless bounds checking was
    /// requested.
    #[inline(always)]
    pub fn set_size(&self) -> usize {
        self.set_size
    }

    /// The `mmap(2)` flags; always includes [`MapMode::FIXED`].
    #[inline(always)]
    pub fn mode(&self) -> MapMode {
        self.mode
    }

    /// Returns `true` if a child is forked between mapping and writing.
    #[inline(always)]
    pub fn fork(&self) -> bool {
        self.fork
    }

    #[inline(always)]
    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Returns `true` if page states are read from `/proc/self/pagemap` after verifying.
    #[inline(always)]
    pub fn pagemap(&self) -> bool {
        self.pagemap
    }
}

fn usage(msg: String) -> ProbeError {
    ProbeError::Usage(msg)
}

fn missing(opt: Opt) -> ProbeError {
    usage(format!("option '--{}' requires an argument", opt.long()))
}

fn number<T: std::str::FromStr>(opt: Opt, value: Option<&str>) -> Result<T> {
    let value = value.ok_or_else(|| missing(opt))?;
    value
        .trim()
        .parse()
        .map_err(|_| usage(format!("invalid value '{}' for '--{}'", value, opt.long())))
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Opt
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opt {
    Debug,
    Keystroke,
    Help,
    ForkChild,
    Begin,
    End,
    MapSize,
    SetSize,
    MapPopulate,
    MapAnonymous,
    MapShared,
    MapPrivate,
    CheckBounds,
    PageMap,
}

impl Opt {
    const ALL: [Opt; 14] = [
        Opt::Debug,
        Opt::Keystroke,
        Opt::Help,
        Opt::ForkChild,
        Opt::Begin,
        Opt::End,
        Opt::MapSize,
        Opt::SetSize,
        Opt::MapPopulate,
        Opt::MapAnonymous,
        Opt::MapShared,
        Opt::MapPrivate,
        Opt::CheckBounds,
        Opt::PageMap,
    ];

    fn short(self) -> char {
        match self {
            Opt::Debug => 'd',
            Opt::Keystroke => 'k',
            Opt::Help => 'h',
            Opt::ForkChild => 'f',
            Opt::Begin => 'b',
            Opt::End => 'e',
            Opt::MapSize => 'm',
            Opt::SetSize => 'n',
            Opt::MapPopulate => 'u',
            Opt::MapAnonymous => 'a',
            Opt::MapShared => 's',
            Opt::MapPrivate => 'p',
            Opt::CheckBounds => 'c',
            Opt::PageMap => 'g',
        }
    }

    fn long(self) -> &'static str {
        match self {
            Opt::Debug => "debug",
            Opt::Keystroke => "keystroke",
            Opt::Help => "help",
            Opt::ForkChild => "fork_child",
            Opt::Begin => "begin",
            Opt::End => "end",
            Opt::MapSize => "map_size",
            Opt::SetSize => "set_size",
            Opt::MapPopulate => "map_populate",
            Opt::MapAnonymous => "map_anonymous",
            Opt::MapShared => "map_shared",
            Opt::MapPrivate => "map_private",
            Opt::CheckBounds => "check_bounds",
            Opt::PageMap => "pagemap",
        }
    }

    fn takes_value(self) -> bool {
        matches!(self, Opt::Begin | Opt::End | Opt::MapSize | Opt::SetSize)
    }

    fn from_short(c: char) -> Option<Self> {
        Self::ALL.iter().copied().find(|opt| opt.short() == c)
    }

    fn from_long(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|opt| opt.long() == name)
    }
}

/// Help text printed for `-h`/`--help` and on malformed arguments.
pub const USAGE: &str = "\
Usage: mmap-fork-probe [OPTION]...
Maps fixed regions at 2^i, optionally forks, then writes and verifies a per-process pattern.

  -d, --debug             report the PID and address touched by every write
  -k, --keystroke         like --debug, but wait for a keystroke before every write
  -h, --help              print this message and exit
  -f, --fork_child        fork a child process after mapping
  -b, --begin <EXP>       first exponent to map (default: 30)
  -e, --end <EXP>         exponent to stop before (default: 39)
  -m, --map_size <BYTES>  bytes per mapping (default: 4096)
  -n, --set_size <BYTES>  bytes written per mapping (default: 4096)
  -u, --map_populate      add MAP_POPULATE
  -a, --map_anonymous     add MAP_ANONYMOUS
  -s, --map_shared        add MAP_SHARED
  -p, --map_private       add MAP_PRIVATE
  -c, --check_bounds      refuse a set_size larger than map_size
  -g, --pagemap           report the state of each region's first page after verifying
";

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
