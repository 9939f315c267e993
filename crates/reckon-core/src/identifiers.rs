//! Creating and sanitizing table and column identifiers.
//!
//! Identifiers derived from user labels are reduced to ASCII
//! `[A-Za-z_][A-Za-z0-9_]*` form and de-duplicated against existing ids
//! (case-insensitively) with numeric suffixes. Reserved words of the
//! formula language are prefixed rather than rejected.

use std::collections::HashSet;

use regex::Regex;
use std::sync::OnceLock;

const RESERVED: &[&str] = &["and", "or", "not", "in", "is", "True", "False", "None", "rec"];

fn invalid_chars_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_]+").expect("identifier regex must compile"))
}

fn sanitize_ident(ident: &str, prefix: &str, capitalize: bool) -> String {
    let mut ident = invalid_chars_re().replace_all(ident, "_").to_string();
    ident = ident.trim_start_matches('_').to_string();
    if ident.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        ident = format!("{}{}", prefix, ident);
    }
    if ident.is_empty() {
        return ident;
    }
    if capitalize {
        let mut chars = ident.chars();
        let first = chars.next().unwrap().to_ascii_uppercase();
        ident = std::iter::once(first).chain(chars).collect();
    }
    while RESERVED.contains(&ident.as_str()) {
        ident = format!("{}{}", prefix, ident);
    }
    ident
}

fn uppercase_set(avoid: &HashSet<String>) -> HashSet<String> {
    avoid.iter().map(|s| s.to_ascii_uppercase()).collect()
}

fn add_suffix(base: &str, avoid: &HashSet<String>, next_suffix: usize) -> String {
    let base = if base.chars().last().is_some_and(|c| c.is_ascii_digit()) {
        format!("{}_", base)
    } else {
        base.to_string()
    };
    let mut suffix = next_suffix;
    loop {
        let ident = format!("{}{}", base, suffix);
        if !avoid.contains(&ident.to_ascii_uppercase()) {
            return ident;
        }
        suffix += 1;
    }
}

fn maybe_add_suffix(ident: String, avoid: &HashSet<String>) -> String {
    if avoid.contains(&ident.to_ascii_uppercase()) {
        add_suffix(&ident, avoid, 2)
    } else {
        ident
    }
}

/// Pick a table identifier from a suggestion, avoiding conflicts.
pub fn pick_table_ident(ident: Option<&str>, avoid: &HashSet<String>) -> String {
    let avoid = uppercase_set(avoid);
    let sanitized = sanitize_ident(ident.unwrap_or(""), "T", true);
    if sanitized.is_empty() {
        add_suffix("Table", &avoid, 1)
    } else {
        maybe_add_suffix(sanitized, &avoid)
    }
}

/// Pick a column identifier from a suggestion, avoiding conflicts.
pub fn pick_col_ident(ident: Option<&str>, avoid: &HashSet<String>) -> String {
    let avoid = uppercase_set(avoid);
    let sanitized = sanitize_ident(ident.unwrap_or(""), "c", false);
    if sanitized.is_empty() {
        gen_ident(&avoid)
    } else {
        maybe_add_suffix(sanitized, &avoid)
    }
}

/// Spreadsheet-style generated names: A..Z, AA, AB, ...
fn gen_ident(avoid: &HashSet<String>) -> String {
    (0..)
        .map(letters_for)
        .find(|name| !avoid.contains(name))
        .unwrap()
}

fn letters_for(index: usize) -> String {
    let mut out = String::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        out.insert(0, (b'A' + (n % 26) as u8) as char);
        n /= 26;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avoid(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_sanitizes_labels() {
        assert_eq!(pick_col_ident(Some("First Name"), &avoid(&[])), "First_Name");
        assert_eq!(pick_col_ident(Some("2nd"), &avoid(&[])), "c2nd");
        assert_eq!(pick_table_ident(Some("my table"), &avoid(&[])), "My_table");
    }

    #[test]
    fn test_dedupes_case_insensitively() {
        assert_eq!(pick_col_ident(Some("name"), &avoid(&["Name"])), "name2");
        assert_eq!(pick_table_ident(None, &avoid(&["Table1"])), "Table2");
    }

    #[test]
    fn test_reserved_words_prefixed() {
        assert_eq!(pick_col_ident(Some("in"), &avoid(&[])), "cin");
        assert_eq!(pick_col_ident(Some("True"), &avoid(&[])), "cTrue");
    }

    #[test]
    fn test_generated_column_names() {
        assert_eq!(pick_col_ident(None, &avoid(&[])), "A");
        assert_eq!(pick_col_ident(None, &avoid(&["A", "B"])), "C");
    }

    #[test]
    fn test_suffix_after_digit_gets_separator() {
        assert_eq!(pick_col_ident(Some("x1"), &avoid(&["x1"])), "x1_2");
    }
}
