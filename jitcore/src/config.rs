//! Tunables for a compilation.
//!
//! A [Config] is created once (normally with [Config::default] or [Config::from_env]) and then
//! handed, immutably, to every compilation: nothing in the allocator or encoder reads ambient
//! global state.

use std::{env, error::Error};

/// The knobs the allocator and encoder consult.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// Track use counts per region (so that eviction prefers values with few remaining uses in
    /// the current loop). If disabled, the flat per-lifetime use count is used everywhere.
    pub region_use_counts: bool,
    /// Allow a spilled value to be re-admitted to a register when it is next used.
    pub second_chance: bool,
    /// Record statement boundaries into [crate::encode::EncodedFunc::stmt_map].
    pub track_statements: bool,
    /// Try to shrink branches to their short form.
    pub shorten_branches: bool,
    /// Loop headers are padded so that they start on a multiple of this many bytes. `0` and `1`
    /// disable padding. Must be a power of two.
    pub loop_align: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region_use_counts: true,
            second_chance: true,
            track_statements: false,
            shorten_branches: true,
            loop_align: 16,
        }
    }
}

impl Config {
    /// Create a [Config] from [Config::default] altered by the `JITCORE_OPTS` environment
    /// variable, if it is set. `JITCORE_OPTS` is a comma separated list of:
    ///
    ///   * `[no-]region-use-counts`
    ///   * `[no-]second-chance`
    ///   * `[no-]stmt-map`
    ///   * `[no-]shorten-branches`
    ///   * `loop-align=<n>`
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        match env::var("JITCORE_OPTS") {
            Ok(s) => Self::default().with_opts(&s),
            Err(_) => Ok(Self::default()),
        }
    }

    /// Return a copy of `self` altered by the comma separated options in `opts` (see
    /// [Config::from_env] for the format).
    pub fn with_opts(mut self, opts: &str) -> Result<Self, Box<dyn Error>> {
        for opt in opts.split(',').map(|x| x.trim()).filter(|x| !x.is_empty()) {
            let (on, name) = match opt.strip_prefix("no-") {
                Some(x) => (false, x),
                None => (true, opt),
            };
            match name {
                "region-use-counts" => self.region_use_counts = on,
                "second-chance" => self.second_chance = on,
                "stmt-map" => self.track_statements = on,
                "shorten-branches" => self.shorten_branches = on,
                _ => match opt.split_once('=') {
                    Some(("loop-align", n)) => {
                        let n = n
                            .parse::<u32>()
                            .map_err(|e| format!("Invalid loop-align '{n}': {e}"))?;
                        if n != 0 && !n.is_power_of_two() {
                            return Err(format!("loop-align {n} is not a power of two").into());
                        }
                        self.loop_align = n;
                    }
                    _ => return Err(format!("Unknown JITCORE_OPTS option '{opt}'").into()),
                },
            }
        }
        Ok(self)
    }
}
