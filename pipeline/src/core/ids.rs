//! Identifier contract for milestones, phases and tasks.
//!
//! Ids double as directory names and are traversed in lexical order, so they
//! must be path-safe and sibling ids must zero-pad their numeric suffix to the
//! same width (`m01`..`m10`, never `m1`..`m10`).

use std::sync::LazyLock;

use regex::Regex;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]*$").expect("id regex"));

/// Returns an error message if `id` is not a valid unit id.
pub fn check_id(id: &str) -> Option<String> {
    if ID_RE.is_match(id) {
        return None;
    }
    Some(format!(
        "invalid id '{id}' (expected letters, digits, '-' or '_', starting with a letter or digit)"
    ))
}

/// Split an id into its non-numeric stem and trailing digit run.
fn split_numeric_suffix(id: &str) -> (&str, &str) {
    let digits = id.bytes().rev().take_while(u8::is_ascii_digit).count();
    id.split_at(id.len() - digits)
}

/// Check that siblings sharing a stem use the same suffix width.
///
/// Returns one message per offending stem.
pub fn check_sibling_widths<'a, I>(ids: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut widths: std::collections::BTreeMap<&str, (usize, &str)> =
        std::collections::BTreeMap::new();
    let mut errors = Vec::new();
    for id in ids {
        let (stem, digits) = split_numeric_suffix(id);
        if digits.is_empty() {
            continue;
        }
        match widths.get(stem) {
            Some((width, first)) if *width != digits.len() => {
                errors.push(format!(
                    "ids '{first}' and '{id}' use different numeric widths (lexical order would not match numeric order)"
                ));
            }
            Some(_) => {}
            None => {
                widths.insert(stem, (digits.len(), id));
            }
        }
    }
    errors
}
