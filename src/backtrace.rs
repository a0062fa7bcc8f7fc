// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::classify::{classify, Classification};
use crate::resolver::{ResolverPool, Spawn};
use fxhash::FxHashMap;
use regex::Regex;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::mem;

/// What to do with lines that aren't part of a backtrace.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextLines {
    /// Drop them.
    Suppress,

    /// Remember the last `n` and print them before the next new backtrace.
    Keep(usize),

    /// Print them straight away.
    PassThrough,
}

impl ContextLines {
    /// `0` suppresses, a negative count passes everything through.
    pub fn from_count(count: i64) -> ContextLines {
        match count {
            0 => ContextLines::Suppress,
            n if n < 0 => ContextLines::PassThrough,
            n => ContextLines::Keep(n as usize),
        }
    }
}

pub struct Config {
    /// Addresses with no module belong to this.
    pub executable: String,
    pub context: ContextLines,

    /// If set, only backtraces whose prefix or held context lines match are
    /// resolved.
    pub context_match: Option<Regex>,

    /// Print `{module} address: ` before each resolved frame.
    pub verbose: bool,
}

/// The backtrace being gathered. Frames are `(module, address)`.
#[derive(Default)]
struct Backtrace {
    prefix: Option<String>,
    frames: Vec<(String, String)>,
}

impl Backtrace {
    /// Identifies backtraces with the same frames, whatever their prefix.
    fn key(&self) -> String {
        let mut key = String::new();
        for (module, address) in &self.frames {
            key.push_str(module);
            key.push('+');
            key.push_str(address);
            key.push('\n');
        }
        key
    }
}

/// The top level structure that does the work: fed one line at a time, it
/// gathers backtraces and prints each distinct one, resolved, to `out`.
pub struct BacktraceResolver<W: Write, S: Spawn> {
    config: Config,
    out: W,
    pool: ResolverPool<S>,
    current: Backtrace,

    /// Holds at most `n` lines for `ContextLines::Keep(n)`.
    context: VecDeque<String>,

    /// Backtrace keys mapped to the number they were printed with.
    known: FxHashMap<String, usize>,
    next_id: usize,
}

impl<W: Write, S: Spawn> BacktraceResolver<W, S> {
    pub fn new(config: Config, spawner: S, out: W) -> BacktraceResolver<W, S> {
        let pool = ResolverPool::new(spawner, &config.executable);
        let context = match config.context {
            ContextLines::Keep(n) => VecDeque::with_capacity(n.min(64)),
            _ => VecDeque::new(),
        };
        BacktraceResolver {
            config,
            out,
            pool,
            current: Backtrace::default(),
            context,
            known: FxHashMap::default(),
            next_id: 0,
        }
    }

    pub fn process(&mut self, line: &str) -> io::Result<()> {
        match classify(line) {
            Classification::Unrecognized(line) => {
                // The backtrace is judged against the context held before
                // this line arrived.
                self.flush_backtrace()?;
                match self.config.context {
                    ContextLines::Keep(n) => {
                        if self.context.len() == n {
                            self.context.pop_front();
                        }
                        self.context.push_back(line.to_string());
                    }
                    ContextLines::PassThrough => writeln!(self.out, "{}", line)?,
                    ContextLines::Suppress => {}
                }
            }
            Classification::Separator => {}
            Classification::Addresses { prefix, entries } => {
                // A line with several addresses is a whole backtrace by
                // itself, never merged with its neighbours.
                let standalone = entries.len() > 1;
                if standalone {
                    self.flush_backtrace()?;
                }
                if self.current.frames.is_empty() {
                    self.current.prefix = prefix.map(str::to_string);
                }
                for entry in entries {
                    let module = entry.module.unwrap_or(self.config.executable.as_str());
                    self.current
                        .frames
                        .push((module.to_string(), entry.address.to_string()));
                }
                if standalone {
                    self.flush_backtrace()?;
                }
            }
        }
        Ok(())
    }

    fn context_matches(&self, prefix: Option<&str>) -> bool {
        let re = match &self.config.context_match {
            Some(re) => re,
            None => return true,
        };
        self.context.iter().any(|line| re.is_match(line))
            || prefix.map_or(false, |prefix| re.is_match(prefix))
    }

    /// Print the current backtrace, if any, unless it fails the context match
    /// or has been printed before. Either way, start a new one.
    fn flush_backtrace(&mut self) -> io::Result<()> {
        if self.current.frames.is_empty() {
            return Ok(());
        }
        let backtrace = mem::take(&mut self.current);

        if !self.context_matches(backtrace.prefix.as_deref()) {
            return Ok(());
        }

        let key = backtrace.key();
        if let Some(id) = self.known.get(&key) {
            writeln!(
                self.out,
                "[Backtrace #{}] Already seen, not resolving again.",
                id
            )?;
            writeln!(self.out)?;
            return Ok(());
        }

        let id = self.next_id;
        self.next_id += 1;
        self.known.insert(key, id);

        for line in &self.context {
            writeln!(self.out, "{}", line)?;
        }
        if let Some(prefix) = &backtrace.prefix {
            writeln!(self.out, "{}", prefix)?;
        }
        writeln!(self.out, "[Backtrace #{}]", id)?;
        for (module, address) in &backtrace.frames {
            let resolved = self.pool.resolve(module, address);
            if self.config.verbose {
                write!(self.out, "{{{}}} {}: ", module, address)?;
            }
            self.out.write_all(resolved.as_bytes())?;
            if !resolved.ends_with('\n') {
                writeln!(self.out)?;
            }
        }
        writeln!(self.out)?;

        Ok(())
    }

    /// Whether the resolver for `module` has given up. `None` if the module
    /// hasn't been needed yet.
    pub fn is_module_missing(&self, module: &str) -> Option<bool> {
        self.pool.is_missing(module)
    }

    /// Print any backtrace still being gathered and hand back the output. The
    /// resolver processes are shut down here too.
    pub fn finish(mut self) -> io::Result<W> {
        self.flush_backtrace()?;
        self.out.flush()?;
        let BacktraceResolver { out, .. } = self;
        Ok(out)
    }
}
