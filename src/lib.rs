// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Rewrite raw addresses in logs (crash backtraces, stall reports, sanitizer
//! output) into symbols, by way of one `addr2line` process per module.

pub mod backtrace;
pub mod classify;
pub mod debuginfo;
pub mod error;
pub mod resolver;

pub use backtrace::{BacktraceResolver, Config, ContextLines};
pub use classify::{classify, parse_token, AddressEntry, Classification};
pub use error::{Error, Result};
pub use resolver::{Addr2Line, Addr2LineSpawner, Resolve, ResolverPool, Spawn};
