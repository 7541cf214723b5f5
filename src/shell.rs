/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Escaping for arguments that end up inside a device-side shell line.

/// Backslash-escapes the characters that are significant inside a
/// double-quoted Android shell word.
pub fn escape(word: &str) -> String {
    let mut escaped = String::with_capacity(word.len());
    for c in word.chars() {
        if matches!(c, '"' | '\\' | '$' | '`') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_pass_through() {
        assert_eq!(escape("am start -W"), "am start -W");
    }

    #[test]
    fn quotes_and_expansions_are_escaped() {
        assert_eq!(escape(r#"say "hi""#), r#"say \"hi\""#);
        assert_eq!(escape("$HOME"), "\\$HOME");
        assert_eq!(escape("a`b\\c"), "a\\`b\\\\c");
    }
}
