//! Launch-line tokeniser.
//!
//! A launch line is the shell-like command template found in `-p`
//! procedure definitions, e.g. `/usr/bin/pandoc --to html !`. Tokens
//! honour double quotes, single quotes and backslash escapes; a bare
//! `!` token marks the argv slot that receives the target file's path
//! at invocation time.

use std::ffi::{OsStr, OsString};
use std::path::PathBuf;

/// Tokens are cut off at this many bytes (the trailing NUL of the wire
/// representation counts toward the limit).
pub const MAX_TOKEN_LENGTH: usize = 0x400;
/// A launch line yields at most this many argv entries.
pub const MAX_ARGS_NUMBER: usize = 0x100;

/// A tokenised launch line: the program path, the argv template and the
/// optional position of the `!` placeholder. `argv[0]` repeats the
/// program path; the placeholder slot holds `None` until realised.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchLine {
    pub path: PathBuf,
    pub argv: Vec<Option<String>>,
    pub file_slot: Option<usize>,
}

impl LaunchLine {
    /// Clone the argv template and fill the placeholder slot (if any)
    /// with `target`. Shared state is never mutated.
    pub fn realize(&self, target: &OsStr) -> Vec<OsString> {
        self.argv
            .iter()
            .map(|arg| match arg {
                Some(word) => OsString::from(word),
                None => target.to_os_string(),
            })
            .collect()
    }
}

enum State {
    Bare,
    DoubleQuoted,
    SingleQuoted,
    BareEscape,
    DoubleQuoteEscape,
}

/// Read one word starting at the current position. Returns the word and
/// the rest of the input, or `None` when only blanks remain.
fn read_word(input: &str) -> Option<(String, &str)> {
    let input = input.trim_start_matches(|c| c == ' ' || c == '\t');
    if input.is_empty() {
        return None;
    }

    let mut word = String::new();
    let mut state = State::Bare;
    let mut end = input.len();

    for (pos, c) in input.char_indices() {
        if word.len() >= MAX_TOKEN_LENGTH - 1 {
            end = pos;
            break;
        }
        match state {
            State::Bare => match c {
                '"' => state = State::DoubleQuoted,
                '\'' => state = State::SingleQuoted,
                '\\' => state = State::BareEscape,
                ' ' | '\t' | '\n' => {
                    end = pos + 1;
                    break;
                }
                _ => word.push(c),
            },
            State::DoubleQuoted => match c {
                '"' => state = State::Bare,
                '\\' => state = State::DoubleQuoteEscape,
                _ => word.push(c),
            },
            State::SingleQuoted => match c {
                '\'' => state = State::Bare,
                _ => word.push(c),
            },
            State::BareEscape => {
                match c {
                    '\\' | '\'' | '"' => word.push(c),
                    't' => word.push('\t'),
                    'n' => word.push('\n'),
                    'r' => word.push('\r'),
                    other => word.push(other),
                }
                state = State::Bare;
            }
            State::DoubleQuoteEscape => {
                match c {
                    '"' | '\\' => word.push(c),
                    other => {
                        word.push('\\');
                        word.push(other);
                    }
                }
                state = State::DoubleQuoted;
            }
        }
    }

    if end == input.len() {
        // ran to the end of the string (possibly inside a quote)
        Some((word, ""))
    } else {
        Some((word, &input[end..]))
    }
}

/// Tokenise a full launch line. The first word names the program and is
/// duplicated at `argv[0]`; the first bare `!` becomes the file slot,
/// later ones stay literal. Returns `None` when the line holds no word.
pub fn tokenize(line: &str) -> Option<LaunchLine> {
    let (first, mut rest) = read_word(line)?;
    if first.is_empty() {
        return None;
    }

    let path = PathBuf::from(&first);
    let mut argv: Vec<Option<String>> = vec![Some(first)];
    let mut file_slot = None;

    while argv.len() < MAX_ARGS_NUMBER {
        let (word, next) = match read_word(rest) {
            Some(parsed) => parsed,
            None => break,
        };
        rest = next;
        if word == "!" && file_slot.is_none() {
            file_slot = Some(argv.len());
            argv.push(None);
        } else {
            argv.push(Some(word));
        }
    }

    Some(LaunchLine {
        path,
        argv,
        file_slot,
    })
}
