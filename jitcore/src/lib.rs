//! The register allocator and machine code encoder of a method JIT.
//!
//! The instruction selection layer hands us a [ir::Func]: a linear list of instructions over an
//! unbounded set of typed symbolic values, annotated with a tree of loop and scope regions. A
//! [Compiler] then:
//!
//!   1. checks that the function is well-formed;
//!   2. allocates registers with a linear scan allocator, rewriting the instruction list in place
//!      (in debug builds the result is then checked by an independent allocation checker);
//!   3. encodes the allocated function into a relocatable buffer with side tables for jump
//!      tables, inlined frames, lazy bailouts, and statement boundaries.
//!
//! Everything architecture specific is a parameter: the allocator only knows registers through
//! [arch::RegT] and [arch::RegSet], and the encoder defers to an [encode::EncodeTable]. An x64
//! (System V) implementation of both is provided in [arch::x64].

#![allow(clippy::new_without_default)]
#![allow(clippy::upper_case_acronyms)]

pub mod arch;
pub mod config;
pub mod encode;
pub mod errors;
pub mod ir;
pub mod log;
mod regalloc;

pub use config::Config;
pub use errors::CompilationError;

use arch::{RegSet, RegT};
use encode::{EncodeTable, EncodedFunc};
use ir::Func;
use log::{
    log_ir, should_log_ir,
    stats::{Counter, Counters, Stats},
    IRPhase, Log, Verbosity,
};
use std::error::Error;

/// Compiles functions. A [Compiler] holds only immutable configuration and thread-safe
/// statistics, so one instance can be shared by any number of threads, each compiling its own
/// functions.
pub struct Compiler {
    cfg: Config,
    log: Log,
    stats: Stats,
}

impl Compiler {
    pub fn new(cfg: Config, log: Log) -> Self {
        Self {
            cfg,
            log,
            stats: Stats::new(),
        }
    }

    /// Create a [Compiler] configured from the `JITCORE_OPTS` and `JITCORE_LOG` environment
    /// variables.
    pub fn from_env() -> Result<Self, Box<dyn Error>> {
        Ok(Self::new(Config::from_env()?, Log::new()?))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Compile `func` for the registers `regset`, encoding with `table`.
    pub fn compile<R: RegT, E: EncodeTable<R>>(
        &self,
        func: Func<R>,
        regset: &RegSet<R>,
        table: &E,
    ) -> Result<EncodedFunc<R>, CompilationError> {
        let name = func.name.clone();
        let mut counters = Counters::new();
        let r = self.compile_func(func, regset, table, &mut counters);
        match &r {
            Ok(enc) => {
                counters.inc(Counter::CompiledOk);
                self.log.log(
                    Verbosity::JITEvent,
                    &format!("compile-func {name}: {} bytes {counters}", enc.code.len()),
                );
            }
            Err(e) => {
                counters.inc(Counter::CompiledErr);
                self.log
                    .log(failure_verbosity(e), &format!("compile-func {name}: {e}"));
            }
        }
        self.stats.record(&counters);
        r
    }

    fn compile_func<R: RegT, E: EncodeTable<R>>(
        &self,
        mut func: Func<R>,
        regset: &RegSet<R>,
        table: &E,
        counters: &mut Counters,
    ) -> Result<EncodedFunc<R>, CompilationError> {
        func.assert_well_formed()?;
        if should_log_ir(IRPhase::PreAlloc) {
            log_ir(&format!(
                "--- Begin pre-alloc ---\n{func}--- End pre-alloc ---\n"
            ));
        }

        let alloc = regalloc::allocate(&mut func, regset, &self.cfg)?;
        counters.merge(&alloc.counters);
        #[cfg(any(debug_assertions, test))]
        regalloc::checker::check(&func, regset)?;
        if should_log_ir(IRPhase::PostAlloc) {
            log_ir(&format!(
                "--- Begin post-alloc ---\n{func}--- End post-alloc ---\n"
            ));
        }

        let enc = encode::encode(&func, &alloc.callee_saved, table, &self.cfg, counters)?;
        if should_log_ir(IRPhase::Asm) {
            let asm = enc.disassemble(true).unwrap_or_else(|e| e.to_string());
            log_ir(&format!("--- Begin asm ---\n{asm}\n--- End asm ---\n"));
        }
        Ok(enc)
    }
}

/// Functions that hit a limit, or that ran out of memory, can be expected to fail again and are
/// not a sign of anything wrong: only the other failures are logged as errors.
fn failure_verbosity(e: &CompilationError) -> Verbosity {
    match e {
        CompilationError::LimitExceeded(_) | CompilationError::ResourceExhausted(_) => {
            Verbosity::Warning
        }
        CompilationError::General(_) | CompilationError::InternalError(_) => Verbosity::Error,
    }
}

impl Drop for Compiler {
    fn drop(&mut self) {
        self.stats.output();
    }
}
