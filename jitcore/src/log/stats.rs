//! Statistics about what the allocator and encoder did.
//!
//! Each compilation counts its own events in a [Counters] (no locking needed: a compilation runs
//! on a single thread). When the compilation finishes the counts are folded into the [Stats] owned
//! by the [crate::Compiler], which is shared between threads.

#[cfg(not(test))]
use std::env;
use std::{fmt, fs, sync::Mutex};
use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

/// The things we count.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Display, EnumCount, EnumIter, PartialEq)]
// The variants range from `0..Counter::COUNT`: don't assign numbers to any of the variants with
// `= <int>`! The `to_string` of each variant is the key that appears in the JSON stats.
pub enum Counter {
    /// A lifetime was moved out of its register into a stack slot for the rest of its life.
    #[strum(to_string = "spills")]
    Spill,
    /// A value was loaded back from its stack slot.
    #[strum(to_string = "reloads")]
    Reload,
    /// A constant was re-materialised rather than reloaded.
    #[strum(to_string = "remats")]
    Remat,
    /// A reloaded value was kept in a register for later uses.
    #[strum(to_string = "second_chance")]
    SecondChance,
    /// A value was saved and restored around a single instruction.
    #[strum(to_string = "saves")]
    Save,
    /// A register to register move was inserted.
    #[strum(to_string = "copies")]
    Copy,
    /// A lifetime was sent to the stack as soon as it started.
    #[strum(to_string = "immediate_spills")]
    ImmediateSpill,
    /// A branch was encoded in its short form.
    #[strum(to_string = "branches_shortened")]
    BranchShortened,
    /// Bytes of no-op padding inserted to align loop headers.
    #[strum(to_string = "padding_bytes")]
    PaddingBytes,
    /// Functions compiled successfully.
    #[strum(to_string = "funcs_compiled_ok")]
    CompiledOk,
    /// Functions whose compilation failed.
    #[strum(to_string = "funcs_compiled_err")]
    CompiledErr,
}

/// The counts of one compilation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Counters([u64; Counter::COUNT]);

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&mut self, c: Counter) {
        self.add(c, 1);
    }

    pub fn add(&mut self, c: Counter, n: u64) {
        self.0[c as usize] += n;
    }

    pub fn get(&self, c: Counter) -> u64 {
        self.0[c as usize]
    }

    pub(crate) fn merge(&mut self, other: &Counters) {
        for (x, y) in self.0.iter_mut().zip(other.0.iter()) {
            *x += *y;
        }
    }

    /// Turn these counts into JSON. The output is guaranteed to be sorted by field name so that
    /// textual matching of the JSON string is possible.
    fn to_json(&self) -> String {
        let mut fields = Counter::iter()
            .map(|c| (c.to_string(), self.get(c)))
            .collect::<Vec<_>>();
        fields.sort_unstable_by(|(k1, _), (k2, _)| k1.cmp(k2));
        format!(
            r#"{{
    {}
}}"#,
            fields
                .iter()
                .map(|(x, y)| format!(r#""{x}": {y}"#))
                .collect::<Vec<_>>()
                .join(",\n    ")
        )
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = Counter::iter()
            .filter(|c| self.get(*c) != 0)
            .map(|c| format!("{c}={}", self.get(c)))
            .collect::<Vec<_>>()
            .join(" ");
        write!(f, "{s}")
    }
}

/// Record jitcore statistics if enabled. In non-testing mode, this is only enabled if the end user
/// defines the environment variable `JITCORE_LOG_STATS`. In testing mode, this is always enabled,
/// with output being sent to `stderr`.
#[derive(Debug)]
pub struct Stats {
    // The outer `Option` means that the common "no stats wanted" case is a cheap check: only if
    // stats are to be recorded do we have to go to the expense of locking a `Mutex`.
    inner: Option<Mutex<StatsInner>>,
}

#[derive(Debug)]
struct StatsInner {
    /// The path to write output. If exactly equal to `-`, output will be written to stderr.
    output_path: String,
    totals: Counters,
}

impl Stats {
    #[cfg(not(test))]
    pub fn new() -> Self {
        Self {
            inner: env::var("JITCORE_LOG_STATS")
                .ok()
                .map(|p| Mutex::new(StatsInner::new(p))),
        }
    }

    #[cfg(test)]
    pub fn new() -> Self {
        Self {
            inner: Some(Mutex::new(StatsInner::new("-".to_string()))),
        }
    }

    /// If `JITCORE_LOG_STATS` was specified, update `inner` by running the function `f`, otherwise
    /// return immediately without calling `f`.
    fn update_with<F>(&self, f: F)
    where
        F: FnOnce(&mut StatsInner),
    {
        if let Some(mtx) = &self.inner {
            // A poisoned lock only means another compilation panicked while adding its counts:
            // the totals are still usable.
            let mut lk = mtx.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut lk);
        }
    }

    /// Fold the counts of one compilation into the totals.
    pub fn record(&self, counters: &Counters) {
        self.update_with(|inner| inner.totals.merge(counters));
    }

    /// A copy of the totals so far, if statistics are enabled.
    pub fn totals(&self) -> Option<Counters> {
        let mut r = None;
        self.update_with(|inner| r = Some(inner.totals.clone()));
        r
    }

    /// Output these statistics to the appropriate output path.
    pub fn output(&self) {
        self.update_with(|inner| inner.output());
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsInner {
    fn new(output_path: String) -> Self {
        Self {
            output_path,
            totals: Counters::new(),
        }
    }

    fn output(&self) {
        let json = self.totals.to_json();
        if self.output_path == "-" {
            eprintln!("{json}");
        } else {
            fs::write(&self.output_path, json).ok();
        }
    }
}
