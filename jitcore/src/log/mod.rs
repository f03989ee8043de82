//! The implementation of the `JITCORE_LOG*` environment variables.
//!
//! Note that IR logging is only meaningfully available when the `jitcore_debug` feature is
//! enabled: otherwise we expose no-op functions.

use std::{env, error::Error, fs::File, io::Write, path::PathBuf};
use strum::{EnumCount, FromRepr};

pub mod stats;

/// How verbose should jitcore's normal logging be?
#[repr(u8)]
#[derive(Copy, Clone, Debug, EnumCount, FromRepr, PartialEq, PartialOrd)]
pub enum Verbosity {
    /// Disable logging entirely.
    Disabled,
    /// Log errors (e.g. a function that failed to compile).
    Error,
    /// Log warnings.
    Warning,
    /// Log JIT events (e.g. a function being compiled, and its statistics).
    JITEvent,
}

#[derive(Debug)]
pub struct Log {
    /// The requested [Verbosity] level for logging.
    level: Verbosity,
    /// The path to write to. A value of `None` should default to the platform specific standard
    /// for logging (e.g. stderr).
    path: Option<PathBuf>,
}

impl Log {
    /// Create a [Log] from the `JITCORE_LOG` environment variable, which has the format
    /// `[<path|->:]<level>`.
    pub fn new() -> Result<Self, Box<dyn Error>> {
        match env::var("JITCORE_LOG") {
            Ok(s) => Self::from_spec(&s),
            Err(_) => Ok(Self {
                path: None,
                level: Verbosity::Error,
            }),
        }
    }

    /// Create a [Log] that never writes anything.
    pub fn disabled() -> Self {
        Self {
            path: None,
            level: Verbosity::Disabled,
        }
    }

    fn from_spec(s: &str) -> Result<Self, Box<dyn Error>> {
        let (path, level) = match s.split(':').collect::<Vec<_>>()[..] {
            [path, level] => {
                if path == "-" {
                    (None, level)
                } else {
                    let path = PathBuf::from(path);
                    // If there's an existing log file, truncate (i.e. empty it), so that later
                    // appends to the log aren't appending to a previous log run.
                    File::create(&path).ok();
                    (Some(path), level)
                }
            }
            [level] => (None, level),
            [..] => return Err("JITCORE_LOG must be of the format `[<path|->:]<level>".into()),
        };
        let level = level
            .parse::<u8>()
            .map_err(|e| format!("Invalid JITCORE_LOG level '{s}': {e}"))?;
        // This unwrap can only fail dynamically if we've got the types wrong statically
        // (i.e. it'll fail as soon as this code is executed for the first time).
        let max_level = u8::try_from(Verbosity::COUNT).unwrap() - 1;
        let level = Verbosity::from_repr(level)
            .ok_or_else(|| format!("JITCORE_LOG level {level} exceeds maximum {max_level}"))?;
        Ok(Self { path, level })
    }

    /// Would a message at `level` be written?
    pub fn enabled(&self, level: Verbosity) -> bool {
        level != Verbosity::Disabled && level <= self.level
    }

    /// Log `msg` with the [Verbosity] level `verbosity`.
    ///
    /// # Panics
    ///
    /// If `level == Verbosity::Disabled`.
    pub fn log(&self, level: Verbosity, msg: &str) {
        if level <= self.level {
            let prefix = match level {
                Verbosity::Disabled => panic!(),
                Verbosity::Error => "jitcore-error",
                Verbosity::Warning => "jitcore-warning",
                Verbosity::JITEvent => "jitcore-jit-event",
            };
            match &self.path {
                Some(p) => {
                    let s = format!("{prefix}: {msg}\n");
                    File::options()
                        .append(true)
                        .open(p)
                        .map(|mut x| x.write(s.as_bytes()))
                        .ok();
                }
                None => {
                    eprintln!("{prefix}: {msg}");
                }
            }
        }
    }
}

#[derive(Eq, Hash, PartialEq)]
#[allow(dead_code)]
pub(crate) enum IRPhase {
    /// The function as handed to us, before register allocation.
    PreAlloc,
    /// The function after register allocation.
    PostAlloc,
    /// The disassembled machine code.
    Asm,
}

#[cfg(not(feature = "jitcore_debug"))]
mod internals {
    use super::IRPhase;
    pub(crate) fn should_log_ir(_: IRPhase) -> bool {
        false
    }
    pub(crate) fn log_ir(_: &str) {}
}

#[cfg(feature = "jitcore_debug")]
mod internals {
    use super::IRPhase;
    use std::{collections::HashSet, env, error::Error, fs::File, io::Write, sync::LazyLock};

    static LOG_IR: LazyLock<Option<(String, HashSet<IRPhase>)>> = LazyLock::new(|| {
        let mut log_phases = HashSet::new();
        if let Ok(x) = env::var("JITCORE_LOG_IR") {
            let (path, phases) = match x.split(':').collect::<Vec<_>>().as_slice() {
                [path, phases] => (*path, *phases),
                [phases] => ("-", *phases),
                _ => panic!(
                    "JITCORE_LOG_IR must be of the format '[<path>:]<phase_1>[,...,<phase_n>]'"
                ),
            };
            for x in phases.split(',') {
                log_phases.insert(IRPhase::from_str(x).unwrap());
            }
            if path != "-" {
                // If there's an existing log file, truncate (i.e. empty it), so that later
                // appends to the log aren't appending to a previous log run.
                File::create(path).ok();
            }
            Some((path.to_string(), log_phases))
        } else {
            None
        }
    });

    impl IRPhase {
        fn from_str(s: &str) -> Result<Self, Box<dyn Error>> {
            match s {
                "pre-alloc" => Ok(Self::PreAlloc),
                "post-alloc" => Ok(Self::PostAlloc),
                "asm" => Ok(Self::Asm),
                _ => Err(format!("Invalid JITCORE_LOG_IR value: {s}").into()),
            }
        }
    }

    pub(crate) fn should_log_ir(phase: IRPhase) -> bool {
        if let Some(true) = LOG_IR.as_ref().map(|(_, phases)| phases.contains(&phase)) {
            return true;
        }
        false
    }

    pub(crate) fn log_ir(s: &str) {
        match LOG_IR.as_ref().map(|(p, _)| p.as_str()) {
            Some("-") => eprint!("{s}"),
            Some(x) => {
                File::options()
                    .append(true)
                    .open(x)
                    .map(|mut x| x.write(s.as_bytes()))
                    .ok();
            }
            None => (),
        }
    }
}

pub(crate) use internals::{log_ir, should_log_ir};
