// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Helpers for the `:`-separated list form in which image paths, subtypes
//! and per-item results travel as single strings.

pub const LIST_SEPARATOR: char = ':';

/// Split a `:`-joined list. Surrounding whitespace on each element is
/// dropped; an empty input is an empty list.
pub fn split_list(s: &str) -> Vec<String> {
    let s = s.trim();
    if s.is_empty() {
        return Vec::new();
    }
    s.split(LIST_SEPARATOR).map(|item| item.trim().to_string()).collect()
}

pub fn join_list<'a, I>(items: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    let mut out = String::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(LIST_SEPARATOR);
        }
        out.push_str(item);
    }
    out
}
