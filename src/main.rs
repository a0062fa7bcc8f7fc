// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use clap::Parser;
use fix_backtraces::{Addr2LineSpawner, BacktraceResolver, Config, ContextLines, Error, Result};
use regex::Regex;
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Read};
use std::path::PathBuf;

/// Resolve the addresses in backtraces found in logs, printing each distinct
/// backtrace once.
///
/// Reads from FILE if given, else treats each ADDRESS as a line of input,
/// else reads stdin. When stdin is a terminal, input ends at an empty line.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// The executable that addresses without a module belong to.
    #[arg(short, long)]
    executable: String,

    /// Read input from this file.
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Non-backtrace lines to print before each backtrace. 0 prints none; a
    /// negative count prints them all, as they arrive.
    #[arg(short, long, default_value_t = 1, allow_negative_numbers = true)]
    before: i64,

    /// Only resolve backtraces whose prefix or preceding lines match this
    /// regex.
    #[arg(short, long = "match", value_name = "REGEX")]
    match_: Option<String>,

    /// Print the module and raw address before each resolved frame.
    #[arg(short, long)]
    verbose: bool,

    /// The resolver to run on each module, invoked as
    /// `<PROGRAM> -Cfpia -e <MODULE>`.
    #[arg(long, value_name = "PROGRAM", default_value = "addr2line")]
    addr2line: String,

    /// Addresses to resolve, in place of an input file.
    #[arg(value_name = "ADDRESS")]
    addresses: Vec<String>,
}

enum Input {
    File(BufReader<File>),
    Addresses(Vec<String>),
    Stdin,
    Terminal,
}

impl Input {
    fn select(file: Option<PathBuf>, addresses: Vec<String>) -> Result<Input> {
        match file {
            Some(_) if !addresses.is_empty() => Err(Error::ConflictingInputs),
            Some(path) => Ok(Input::File(BufReader::new(File::open(path)?))),
            None if !addresses.is_empty() => Ok(Input::Addresses(addresses)),
            None if atty::is(atty::Stream::Stdin) => Ok(Input::Terminal),
            None => Ok(Input::Stdin),
        }
    }

    fn for_each_line(self, mut f: impl FnMut(&str) -> io::Result<()>) -> Result<()> {
        match self {
            Input::File(reader) => for_each_line(reader, f)?,
            Input::Addresses(addresses) => {
                for address in &addresses {
                    f(address)?;
                }
            }
            Input::Stdin => for_each_line(io::stdin().lock(), f)?,
            Input::Terminal => {
                eprintln!("Paste the backtrace, then press Enter twice (or Ctrl-D):");
                for line in read_pasted(io::stdin().lock())? {
                    f(&line)?;
                }
            }
        }
        Ok(())
    }
}

/// Logs aren't always valid UTF-8, so don't insist on it.
fn for_each_line<R: BufRead>(
    mut reader: R,
    mut f: impl FnMut(&str) -> io::Result<()>,
) -> io::Result<()> {
    let mut buf = vec![];
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(());
        }
        let line = String::from_utf8_lossy(&buf);
        f(line.trim_end_matches(&['\r', '\n'][..]))?;
    }
}

/// Read pasted lines until two line feeds in a row, or EOF. Empty lines are
/// dropped.
fn read_pasted<R: Read>(reader: R) -> io::Result<Vec<String>> {
    let mut lines = vec![];
    let mut line = vec![];
    let mut linefeeds = 0;
    for byte in reader.bytes() {
        let byte = byte?;
        if byte == b'\n' {
            linefeeds += 1;
            if !line.is_empty() {
                lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
                line.clear();
            }
            if linefeeds == 2 {
                return Ok(lines);
            }
        } else {
            line.push(byte);
            linefeeds = 0;
        }
    }
    if !line.is_empty() {
        lines.push(String::from_utf8_lossy(&line).trim_end().to_string());
    }
    Ok(lines)
}

fn main_inner() -> Result<()> {
    let args = Args::parse();

    let config = Config {
        executable: args.executable,
        context: ContextLines::from_count(args.before),
        context_match: args.match_.as_deref().map(Regex::new).transpose()?,
        verbose: args.verbose,
    };
    let input = Input::select(args.file, args.addresses)?;

    let stdout = io::stdout();
    let out = BufWriter::new(stdout.lock());
    let spawner = Addr2LineSpawner::new(&args.addr2line);
    let mut resolver = BacktraceResolver::new(config, spawner, out);

    // Whatever happened to the input, the last backtrace still gets printed.
    let result = input.for_each_line(|line| resolver.process(line));
    let finished = resolver.finish();
    result?;
    finished?;

    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp(None)
        .init();

    // Ignore broken pipes, e.g. when piping output through `head -10`.
    if let Err(err) = main_inner() {
        if !err.is_broken_pipe() {
            eprintln!("fix-backtraces: {}", err);
            std::process::exit(1);
        }
    }
}
