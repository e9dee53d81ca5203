use clap::{crate_description, crate_name, crate_version};
use clap::{Arg, Command};
use std::path::Path;

use hprof_retain::errors::HprofRetainError;
use hprof_retain::errors::HprofRetainError::{InputFileNotFound, InvalidTopPositiveInt};

fn command() -> Command {
    Command::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::new("inputFile")
                .help("preprocessed heap-graph snapshot file")
                .long("inputFile")
                .short('i')
                .num_args(1)
                .required(true),
        )
        .arg(
            Arg::new("top")
                .help("the number of top retainers to display")
                .long("top")
                .short('t')
                .num_args(1)
                .default_value("20")
                .value_parser(clap::value_parser!(usize))
                .required(false),
        )
        .arg(
            Arg::new("cache-dir")
                .help("directory for analysis artifacts (default: next to the snapshot)")
                .long("cache-dir")
                .short('c')
                .num_args(1)
                .required(false),
        )
        .arg(
            Arg::new("temp")
                .help("keep analysis artifacts in temporary storage only")
                .long("temp")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("debug")
                .help("debug info")
                .long("debug")
                .short('d')
                .action(clap::ArgAction::SetTrue),
        )
}

pub struct Args {
    pub file_path: String,
    pub top: usize,
    pub cache_dir: Option<String>,
    pub temporary: bool,
    pub debug: bool,
}

pub fn get_args() -> Result<Args, HprofRetainError> {
    let matches = command().get_matches();

    let input_file = matches
        .get_one::<String>("inputFile")
        .expect("impossible")
        .trim();
    if !Path::new(&input_file).is_file() {
        return Err(InputFileNotFound {
            name: input_file.to_string(),
        });
    }

    let top: usize = *matches.get_one("top").expect("impossible");
    if top == 0 {
        return Err(InvalidTopPositiveInt);
    }

    let cache_dir = matches.get_one::<String>("cache-dir").cloned();
    let temporary = matches.get_flag("temp");
    let debug = matches.get_flag("debug");
    let args = Args {
        file_path: input_file.to_string(),
        top,
        cache_dir,
        temporary,
        debug,
    };
    Ok(args)
}

#[cfg(test)]
mod args_tests {
    use crate::args::command;

    #[test]
    fn verify_command() {
        command().debug_assert();
    }
}
