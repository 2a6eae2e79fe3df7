use std::ffi::OsString;
use std::path::{Path, PathBuf};

use clap::{App, AppSettings, Arg};

use crate::procedure::Procedure;

/// Everything the bootstrap needs: the surviving procedures in
/// command-line order, the two positional paths, and the options
/// forwarded untouched to the filesystem host.
pub struct Config {
    pub procedures: Vec<Procedure>,
    pub mirror: PathBuf,
    pub mountpoint: PathBuf,
    pub fuse_args: Vec<OsString>,
}

pub fn get_args_parser() -> App<'static, 'static> {
    App::new("scriptfs")
        .about("Mirror a directory, serving recognised scripts as the output of a program run against them.")
        .setting(AppSettings::DisableVersion)
        .arg(Arg::with_name("procedure")
            .short("p")
            .long("procedure")
            .help("Add a procedure PROGRAM[;TEST] telling which files are scripts and how to run them. May be repeated; first match wins.")
            .multiple(true)
            .number_of_values(1)
            .takes_value(true))
        .arg(Arg::with_name("option")
            .short("o")
            .help("Mount option passed through to the filesystem host.")
            .multiple(true)
            .number_of_values(1)
            .takes_value(true))
        .arg(Arg::with_name("mirror")
            .help("Existing directory projected into the mount point.")
            .required(true)
            .validator(directory_validator))
        .arg(Arg::with_name("mountpoint")
            .help("Directory used as the mount point.")
            .required(true)
            .validator(directory_validator))
}

/// Parse the command line; usage errors terminate the process with
/// `EX_USAGE`. Procedures that reference missing binaries have already
/// printed their diagnostic and are simply absent from the result.
pub fn parse_config() -> Config {
    let matches = match get_args_parser().get_matches_safe() {
        Ok(matches) => matches,
        Err(error) => {
            if error.use_stderr() {
                eprintln!("{}", error.message);
                std::process::exit(64); // sysexits.h EX_USAGE
            }
            // --help lands here
            println!("{}", error.message);
            std::process::exit(0);
        }
    };

    debug!("scriptfs startup with args:\n{:#?}", matches);

    // option(s) -p, kept in command-line order
    let procedures: Vec<Procedure> = match matches.values_of("procedure") {
        Some(values) => values.filter_map(Procedure::parse).collect(),
        None => vec![],
    };

    // option(s) -o, forwarded verbatim to the host
    let mut fuse_args: Vec<OsString> = vec![];
    if let Some(options) = matches.values_of_os("option") {
        for option in options {
            fuse_args.push(OsString::from("-o"));
            fuse_args.push(option.to_os_string());
        }
    }

    Config {
        procedures,
        mirror: PathBuf::from(matches.value_of_os("mirror").unwrap()),
        mountpoint: PathBuf::from(matches.value_of_os("mountpoint").unwrap()),
        fuse_args,
    }
}

/// Check whether the path exists and is a directory.
fn directory_validator(path: String) -> Result<(), String> {
    if Path::new(&path).is_dir() {
        Ok(())
    } else {
        Err(path + " is not a directory.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_validator() {
        assert_eq!(directory_validator("/".to_string()), Ok(()));
        assert!(directory_validator("/no/such/directory".to_string()).is_err());
        assert!(directory_validator("/etc/hostname".to_string()).is_err());
    }

    #[test]
    fn test_parser_accepts_repeated_flags() {
        let matches = get_args_parser()
            .get_matches_from_safe(vec![
                "scriptfs",
                "-p",
                "/bin/cat ! ; ALWAYS",
                "-p",
                ";EXECUTABLE",
                "-o",
                "allow_other",
                "-o",
                "ro",
                "/",
                "/",
            ])
            .unwrap();
        let procedures: Vec<&str> = matches.values_of("procedure").unwrap().collect();
        assert_eq!(procedures, vec!["/bin/cat ! ; ALWAYS", ";EXECUTABLE"]);
        let options: Vec<&str> = matches.values_of("option").unwrap().collect();
        assert_eq!(options, vec!["allow_other", "ro"]);
    }

    #[test]
    fn test_parser_requires_positionals() {
        assert!(get_args_parser()
            .get_matches_from_safe(vec!["scriptfs", "/"])
            .is_err());
    }
}
