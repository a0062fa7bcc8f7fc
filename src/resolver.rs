// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::debuginfo::{self, DebugInfo};
use fxhash::FxHashMap;
use log::{debug, trace, warn};
use std::collections::hash_map::Entry;
use std::io::{self, BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

/// What `addr2line -a` prints for an empty request. We send one after every
/// real request so we know where its (possibly multi-line, due to inlining)
/// output ends.
const SENTINEL: &str = "0x0000000000000000: ?? ??:0";

/// Turns addresses within one module into symbol text.
pub trait Resolve {
    /// The resolved text for `address`, one or more `\n`-terminated lines.
    /// Never fails: an unusable resolver produces `fallback` text instead.
    fn resolve(&mut self, address: &str) -> String;

    fn is_missing(&self) -> bool;
}

/// Creates a resolver for a module the first time that module is seen.
pub trait Spawn {
    type Resolver: Resolve;

    fn spawn(&self, module: &str) -> Self::Resolver;
}

/// The text printed for an address that can't be resolved.
pub fn fallback(module: &str, address: &str) -> String {
    format!("{} {}\n", module, address)
}

/// A running resolver process.
struct Process {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Process {
    fn start(program: &str, module: &str) -> io::Result<Process> {
        debug!("running `{} -Cfpia -e {}`", program, module);
        let mut child = Command::new(program)
            .args(["-Cfpia", "-e", module])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(no_pipe)?;
        let stdout = BufReader::new(child.stdout.take().ok_or_else(no_pipe)?);
        let mut process = Process {
            child,
            stdin,
            stdout,
        };

        // If the module doesn't exist, addr2line just exits. There's no
        // telling how long that takes, so rather than waiting on it we send an
        // empty request and see whether an answer comes back.
        process.stdin.write_all(b"\n")?;
        process.stdin.flush()?;
        process.read_line()?;

        Ok(process)
    }

    fn read_line(&mut self) -> io::Result<String> {
        let mut line = String::new();
        if self.stdout.read_line(&mut line)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "resolver exited",
            ));
        }
        Ok(line)
    }

    fn query(&mut self, address: &str) -> io::Result<String> {
        // The blank line forces out a sentinel after the real answer.
        write!(self.stdin, "{}\n\n", address)?;
        self.stdin.flush()?;

        // The first line echoes the address, e.g. `0x1234: main at a.c:5`.
        let first = self.read_line()?;
        let mut resolved = match first.split_once(": ") {
            Some((_, rest)) => rest.to_string(),
            None => first,
        };

        loop {
            let line = self.read_line()?;
            if line.trim_end_matches(&['\r', '\n'][..]) == SENTINEL {
                return Ok(resolved);
            }
            resolved.push_str(&line);
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn no_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "resolver pipe unavailable")
}

/// An `addr2line` process bound to a single module. `process` is `None` once
/// the module is known to be missing.
pub struct Addr2Line {
    module: String,
    process: Option<Process>,
}

impl Addr2Line {
    pub fn new(program: &str, module: &str) -> Addr2Line {
        if debuginfo::inspect(module) == DebugInfo::Absent {
            warn!(
                "`{}` has no debug info; resolved addresses may lack file and line",
                module
            );
        }

        let process = match Process::start(program, module) {
            Ok(process) => Some(process),
            Err(err) => {
                warn!(
                    "can't resolve addresses in `{}` ({}); printing them unresolved",
                    module, err
                );
                None
            }
        };

        Addr2Line {
            module: module.to_string(),
            process,
        }
    }
}

impl Resolve for Addr2Line {
    fn resolve(&mut self, address: &str) -> String {
        let process = match self.process.as_mut() {
            Some(process) => process,
            None => return fallback(&self.module, address),
        };

        trace!("resolving {} in `{}`", address, self.module);
        match process.query(address) {
            Ok(resolved) => resolved,
            Err(err) => {
                // Don't retry; the module stays missing for the rest of the
                // run.
                warn!(
                    "resolver for `{}` failed ({}); printing its addresses unresolved",
                    self.module, err
                );
                self.process = None;
                fallback(&self.module, address)
            }
        }
    }

    fn is_missing(&self) -> bool {
        self.process.is_none()
    }
}

/// Spawns an `addr2line`-compatible program per module.
pub struct Addr2LineSpawner {
    program: String,
}

impl Addr2LineSpawner {
    pub fn new(program: &str) -> Addr2LineSpawner {
        Addr2LineSpawner {
            program: program.to_string(),
        }
    }
}

impl Spawn for Addr2LineSpawner {
    type Resolver = Addr2Line;

    fn spawn(&self, module: &str) -> Addr2Line {
        Addr2Line::new(&self.program, module)
    }
}

/// One resolver per module, created lazily, except for the primary executable
/// which is set up front. Resolvers live until the pool is dropped.
pub struct ResolverPool<S: Spawn> {
    spawner: S,
    resolvers: FxHashMap<String, S::Resolver>,
}

impl<S: Spawn> ResolverPool<S> {
    pub fn new(spawner: S, executable: &str) -> ResolverPool<S> {
        let mut resolvers = FxHashMap::default();
        resolvers.insert(executable.to_string(), spawner.spawn(executable));
        ResolverPool { spawner, resolvers }
    }

    pub fn resolve(&mut self, module: &str, address: &str) -> String {
        let resolver = match self.resolvers.entry(module.to_string()) {
            Entry::Occupied(o) => o.into_mut(),
            Entry::Vacant(v) => v.insert(self.spawner.spawn(module)),
        };
        resolver.resolve(address)
    }

    /// `None` if `module` hasn't been seen yet.
    pub fn is_missing(&self, module: &str) -> Option<bool> {
        self.resolvers.get(module).map(Resolve::is_missing)
    }
}
