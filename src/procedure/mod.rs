//! Procedures: the pairing of a recognition predicate (Test) with a
//! synthesis action (Program), parsed from the `-p` mini-language
//! `PROGRAM[;TEST]`.

pub mod launch;
mod program;
mod test;

pub use self::program::Program;
pub use self::test::Test;

use std::path::{Path, PathBuf};

use nix::sys::stat;
use nix::unistd::{access, AccessFlags};
use regex::bytes::Regex;

use crate::procedure::launch::LaunchLine;

/// Configuration shared by every launched binary: the executable path,
/// the argv template and the filter flag. `filter` records that the
/// binary was a live executable at parse time and may be fed the target
/// file on standard input when the launch line has no `!` slot.
#[derive(Debug, Clone)]
pub struct Launcher {
    pub path: PathBuf,
    pub line: LaunchLine,
    pub filter: bool,
}

/// One operator rule: when `test` matches a path, `program` produces
/// its bytes. Immutable after construction.
pub struct Procedure {
    pub test: Test,
    pub program: Program,
}

impl Procedure {
    /// Parse one `-p` argument. Returns `None` (with a diagnostic on
    /// stderr) when the rule references a binary that cannot be
    /// executed; such rules are dropped and the remaining ones keep
    /// their order.
    pub fn parse(text: &str) -> Option<Procedure> {
        if text.is_empty() {
            return None;
        }
        let (program_part, test_part) = match text.find(';') {
            Some(pos) => (text[..pos].trim(), Some(text[pos + 1..].trim())),
            None => (text.trim(), None),
        };

        let program = parse_program(program_part)?;
        let test = match test_part {
            Some(test_part) => parse_test(test_part)?,
            None => match &program {
                // the same binary doubles as the test: exit 0 means
                // "is a script"
                Program::External(launcher) => Test::Program(launcher.clone()),
                Program::Shell => Test::ShebangOrExecutable,
            },
        };

        Some(Procedure { test, program })
    }

    /// The rule installed when no `-p` survives parsing: run shebang
    /// or executable files as themselves.
    pub fn default_auto() -> Procedure {
        Procedure {
            test: Test::ShebangOrExecutable,
            program: Program::Shell,
        }
    }
}

/// Ordered rule list; the first procedure whose test matches wins.
#[derive(Default)]
pub struct ProcedureList(Vec<Procedure>);

impl ProcedureList {
    pub fn new(procedures: Vec<Procedure>) -> ProcedureList {
        ProcedureList(procedures)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Procedure> {
        self.0.iter()
    }
}

fn parse_program(text: &str) -> Option<Program> {
    if text.is_empty() || prefix_ignore_case(text, "AUTO") {
        return Some(Program::Shell);
    }
    let line = launch::tokenize(text)?;
    if !is_executable_file(&line.path) {
        eprintln!("{} can not be found or executed", line.path.display());
        return None;
    }
    Some(Program::External(Launcher {
        path: line.path.clone(),
        line,
        filter: true,
    }))
}

fn parse_test(text: &str) -> Option<Test> {
    if text.is_empty() || prefix_ignore_case(text, "ALWAYS") {
        return Some(Test::Always);
    }
    if prefix_ignore_case(text, "EXECUTABLE") {
        return Some(Test::Executable);
    }
    if let Some(pattern) = text.strip_prefix('&') {
        return Some(match Regex::new(pattern) {
            Ok(re) => Test::PatternMatch(re),
            Err(err) => {
                warn!("invalid pattern {:?}, no file will match it: {}", pattern, err);
                Test::Never
            }
        });
    }
    let line = launch::tokenize(text)?;
    if !is_executable_file(&line.path) {
        eprintln!("{} can not be found or executed", line.path.display());
        return None;
    }
    Some(Test::Program(Launcher {
        path: line.path.clone(),
        line,
        filter: true,
    }))
}

/// The keywords of the mini-language compare by prefix, matching the
/// original command-line syntax (`AUTOmatic` still selects AUTO).
fn prefix_ignore_case(text: &str, keyword: &str) -> bool {
    text.len() >= keyword.len()
        && text.as_bytes()[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
}

/// A binary named in a procedure must exist, be a regular file and be
/// executable by the invoking user.
fn is_executable_file(path: &Path) -> bool {
    match stat::stat(path) {
        Ok(st) => {
            (st.st_mode & libc::S_IFMT) == libc::S_IFREG
                && access(path, AccessFlags::X_OK).is_ok()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_string_is_dropped() {
        assert!(Procedure::parse("").is_none());
    }

    #[test]
    fn test_parse_auto_selects_shell() {
        for text in &["AUTO", "auto", "Automatic"] {
            let procedure = Procedure::parse(text).unwrap();
            assert!(matches!(procedure.program, Program::Shell));
            assert!(matches!(procedure.test, Test::ShebangOrExecutable));
        }
    }

    #[test]
    fn test_parse_empty_program_with_test() {
        let procedure = Procedure::parse(";ALWAYS").unwrap();
        assert!(matches!(procedure.program, Program::Shell));
        assert!(matches!(procedure.test, Test::Always));
    }

    #[test]
    fn test_parse_external_program_infers_same_test() {
        let procedure = Procedure::parse("/bin/cat !").unwrap();
        let launcher = match &procedure.program {
            Program::External(launcher) => launcher,
            Program::Shell => panic!("expected an external program"),
        };
        assert_eq!(launcher.path, PathBuf::from("/bin/cat"));
        assert_eq!(launcher.line.file_slot, Some(1));
        assert!(launcher.filter);

        match &procedure.test {
            Test::Program(test_launcher) => {
                assert_eq!(test_launcher.path, launcher.path);
                assert_eq!(test_launcher.line, launcher.line);
            }
            _ => panic!("expected the inferred program test"),
        }
    }

    #[test]
    fn test_parse_pattern_test() {
        let procedure = Procedure::parse(r"/bin/cat ! ; &\.md$").unwrap();
        match &procedure.test {
            Test::PatternMatch(re) => {
                assert!(re.is_match(b"x.md"));
                assert!(!re.is_match(b"x.txt"));
            }
            _ => panic!("expected a pattern test"),
        }
    }

    #[test]
    fn test_parse_invalid_pattern_becomes_never() {
        let procedure = Procedure::parse("/bin/cat ! ; &((").unwrap();
        assert!(matches!(procedure.test, Test::Never));
    }

    #[test]
    fn test_parse_keyword_tests() {
        assert!(matches!(
            Procedure::parse("/bin/cat ! ; ALWAYS").unwrap().test,
            Test::Always
        ));
        assert!(matches!(
            Procedure::parse("/bin/cat ! ; executable").unwrap().test,
            Test::Executable
        ));
        assert!(matches!(
            Procedure::parse("/bin/cat ! ;").unwrap().test,
            Test::Always
        ));
    }

    #[test]
    fn test_parse_external_test_program() {
        let procedure = Procedure::parse("/bin/cat ! ; /usr/bin/test -s !").unwrap();
        match &procedure.test {
            Test::Program(launcher) => {
                assert_eq!(launcher.path, PathBuf::from("/usr/bin/test"));
                assert_eq!(launcher.line.file_slot, Some(2));
            }
            _ => panic!("expected a program test"),
        }
    }

    #[test]
    fn test_parse_missing_binary_drops_procedure() {
        assert!(Procedure::parse("/nonexistent/scriptfs-prog !").is_none());
        assert!(Procedure::parse("/bin/cat ! ; /nonexistent/scriptfs-test !").is_none());
    }

    #[test]
    fn test_parse_non_executable_binary_drops_procedure() {
        // /etc/hostname exists but is not executable
        assert!(Procedure::parse("/etc/hostname !").is_none());
    }

    #[test]
    fn test_default_procedure_shape() {
        let procedure = Procedure::default_auto();
        assert!(matches!(procedure.program, Program::Shell));
        assert!(matches!(procedure.test, Test::ShebangOrExecutable));
    }

    #[test]
    fn test_is_executable_file() {
        assert!(is_executable_file(Path::new("/bin/sh")));
        assert!(!is_executable_file(Path::new("/nonexistent-program")));
        // a directory is executable but not a regular file
        assert!(!is_executable_file(Path::new("/bin")));
    }
}
