// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use goblin::{mach, Object};
use memmap2::Mmap;
use std::fs::File;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DebugInfo {
    Present,
    Absent,

    /// The file couldn't be read or isn't a format we look inside.
    Unknown,
}

/// Take a quick look at `file_name` to see whether it carries DWARF debug
/// info. This is only used to warn the user early; the resolver is run
/// regardless of the result.
///
/// The file is mapped rather than read, because modules can be several GB and
/// only the headers and section names get looked at.
pub fn inspect(file_name: &str) -> DebugInfo {
    let file = match File::open(file_name) {
        Ok(file) => file,
        Err(_) => return DebugInfo::Unknown,
    };
    // SAFETY: the mapping is only read, and only for the duration of this
    // call. A module being rewritten underneath us is not something we guard
    // against, the same as `addr2line` itself.
    let data = match unsafe { Mmap::map(&file) } {
        Ok(data) => data,
        Err(_) => return DebugInfo::Unknown,
    };

    match Object::parse(&data) {
        Ok(Object::Elf(elf)) => {
            let has_debug_info = elf.section_headers.iter().any(|section| {
                matches!(
                    elf.shdr_strtab.get_at(section.sh_name),
                    Some(".debug_info") | Some(".zdebug_info")
                )
            });
            present_if(has_debug_info)
        }
        // On Mac the DWARF usually lives elsewhere (a `.dSYM` bundle or the
        // original object files), so only a `__DWARF` segment counts here.
        Ok(Object::Mach(mach::Mach::Binary(macho))) => {
            let has_debug_info = macho
                .segments
                .iter()
                .any(|segment| matches!(segment.name(), Ok("__DWARF")));
            present_if(has_debug_info)
        }
        _ => DebugInfo::Unknown,
    }
}

fn present_if(present: bool) -> DebugInfo {
    if present {
        DebugInfo::Present
    } else {
        DebugInfo::Absent
    }
}
