// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Recognition of the address-bearing lines we know how to resolve.
//!
//! Three shapes are understood, tried in this order:
//!
//! - Separator lines, e.g. `--------`, which are dropped.
//! - Address lists, optionally preceded by a prefix ending in a cue such as
//!   `at`, `backtrace:` or a bare colon:
//!   `Reactor stalled on shard 1. Backtrace: 0x12f34 /lib64/libc.so.6+0x2a1f0`
//! - Sanitizer frames, where a single `(module+0xoffset)` pair closes an
//!   otherwise free-form line:
//!   `#3 0x5f2a1 in foo() (/usr/bin/server+0x5f2a1) (BuildId: 7c1e2b)`
//!
//! Everything else is unrecognized and left to the caller.

/// An address found in the input. A `module` of `None` means the address
/// belongs to the primary executable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddressEntry<'a> {
    pub module: Option<&'a str>,
    pub address: &'a str,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Classification<'a> {
    /// A decorative rule, e.g. `--------`.
    Separator,

    /// One or more addresses, with the descriptive text that came before
    /// them (trimmed), if any.
    Addresses {
        prefix: Option<&'a str>,
        entries: Vec<AddressEntry<'a>>,
    },

    /// Anything else, verbatim.
    Unrecognized(&'a str),
}

pub fn classify(line: &str) -> Classification<'_> {
    if is_separator(line) {
        return Classification::Separator;
    }

    if let Some((prefix, entries)) = address_list(line) {
        return Classification::Addresses { prefix, entries };
    }

    if let Some(entry) = sanitizer_frame(line) {
        return Classification::Addresses {
            prefix: None,
            entries: vec![entry],
        };
    }

    Classification::Unrecognized(line)
}

/// A line made only of non-word characters, with at least one dash.
fn is_separator(line: &str) -> bool {
    line.contains('-') && !line.chars().any(|c| c.is_alphanumeric() || c == '_')
}

/// `0x` followed by at least one hex digit, case-insensitively.
fn is_hex_address(text: &str) -> bool {
    match text.get(..2) {
        Some(head) if head.eq_ignore_ascii_case("0x") => {
            let digits = &text[2..];
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        _ => false,
    }
}

/// Split a `0xHEX` or `module+0xHEX` token. The module is everything up to
/// the last `+`, since a hex address can't contain one.
pub fn parse_token(token: &str) -> Option<AddressEntry<'_>> {
    match token.rsplit_once('+') {
        Some((module, address)) if !module.is_empty() && is_hex_address(address) => {
            Some(AddressEntry {
                module: Some(module),
                address,
            })
        }
        None if is_hex_address(token) => Some(AddressEntry {
            module: None,
            address: token,
        }),
        _ => None,
    }
}

/// Does `text` end with something that introduces an address list?
fn ends_with_cue(text: &str) -> bool {
    let ends_with = |cue: &str| {
        text.len()
            .checked_sub(cue.len())
            .and_then(|start| text.get(start..))
            .map_or(false, |tail| tail.eq_ignore_ascii_case(cue))
    };
    text.ends_with(':') || ends_with("at") || ends_with("backtrace")
}

/// Match whitespace-separated address tokens covering all of `text`. The list
/// may instead be cut short by a `)` within a word, after which anything goes.
/// As many tokens as possible are taken.
///
/// On success the tokens are appended to `entries`; on failure `entries` is
/// left untouched.
fn address_tokens<'a>(text: &'a str, entries: &mut Vec<AddressEntry<'a>>) -> bool {
    let start = entries.len();

    // The furthest `)` cut-off seen so far, and how many entries precede it.
    let mut cut = None;

    for word in text.split_whitespace() {
        if let Some(entry) = closing_paren_cut(word) {
            cut = Some((entries.len(), entry));
        }
        match parse_token(word) {
            Some(entry) => entries.push(entry),
            None => match cut {
                Some((len, entry)) => {
                    entries.truncate(len);
                    entries.push(entry);
                    return true;
                }
                None => {
                    entries.truncate(start);
                    return false;
                }
            },
        }
    }

    entries.len() > start
}

/// A token ending just before a `)` in `word`, preferring the furthest `)`.
fn closing_paren_cut(word: &str) -> Option<AddressEntry<'_>> {
    word.match_indices(')')
        .rev()
        .find_map(|(end, _)| parse_token(&word[..end]))
}

/// Match the address-list form. The prefix is as long as possible, so that
/// it can swallow earlier parenthesized traces, e.g. nested exceptions.
fn address_list(line: &str) -> Option<(Option<&str>, Vec<AddressEntry<'_>>)> {
    let mut entries = vec![];

    let prefix_ends = line
        .char_indices()
        .rev()
        .filter(|&(_, c)| c.is_whitespace())
        .map(|(index, _)| index);
    for end in prefix_ends {
        let prefix = &line[..end];
        if !ends_with_cue(prefix) {
            continue;
        }
        let tokens = line[end..].trim_start();
        if !tokens.is_empty() && address_tokens(tokens, &mut entries) {
            return Some((Some(prefix.trim()), entries));
        }
    }

    // No cue: the line must start with the addresses, leading whitespace
    // aside.
    let tokens = line.trim_start();
    if !tokens.is_empty() && address_tokens(tokens, &mut entries) {
        return Some((None, entries));
    }

    None
}

/// Remove a trailing ` (BuildId: 0123abcd)` annotation, if present.
fn strip_build_id(line: &str) -> &str {
    const BUILD_ID: &str = "(BuildId: ";

    if let Some(start) = line.rfind(BUILD_ID) {
        let before = &line[..start];
        let is_build_id = line[start + BUILD_ID.len()..]
            .strip_suffix(')')
            .map_or(false, |id| {
                !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit())
            });
        if is_build_id && before.ends_with(char::is_whitespace) {
            return before.trim_end();
        }
    }
    line
}

/// Match the sanitizer form: a whitespace-preceded `(module+0xHEX)` or
/// `(0xHEX)` at the very end of the line. Some sanitizers put spaces around
/// the `+`, e.g. `(module + 0xHEX)`.
fn sanitizer_frame(line: &str) -> Option<AddressEntry<'_>> {
    let line = strip_build_id(line.trim_end());
    let (_, word) = line.rsplit_once(char::is_whitespace)?;
    match word.strip_prefix('(').and_then(|word| word.strip_suffix(')')) {
        Some(inner) => parse_token(inner),
        None => spaced_sanitizer_frame(line),
    }
}

fn spaced_sanitizer_frame(line: &str) -> Option<AddressEntry<'_>> {
    let body = line.strip_suffix(')')?;
    let (rest, address) = body.rsplit_once(char::is_whitespace)?;
    let (rest, address) = match address.strip_prefix('+') {
        Some(address) => (rest, address),
        None => (rest.trim_end().strip_suffix('+')?, address),
    };
    if !is_hex_address(address) {
        return None;
    }

    let (_, module) = rest.trim_end().rsplit_once(char::is_whitespace)?;
    let module = module.strip_prefix('(')?;
    if module.is_empty() {
        return None;
    }
    Some(AddressEntry {
        module: Some(module),
        address,
    })
}
