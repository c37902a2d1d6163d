use std::process::ExitCode;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{crate_version, Arg, ArgAction, ValueHint};

use git_fastclone::exec::ExitStatusKind;
use git_fastclone::{Error, Options};

fn clap() -> clap::Command {
    use clap::Command;
    Command::new("git-fastclone")
        .version(crate_version!())
        .about("Recursive repository checkout accelerator with a shared reference-mirror cache")
        .arg(
            Arg::new("repository")
                .help("repository to clone")
                .required(false)
                .index(1),
        )
        .arg(
            Arg::new("path")
                .help("destination path")
                .required(false)
                .index(2)
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::DirPath),
        )
        .arg(
            Arg::new("branch")
                .short('b')
                .long("branch")
                .value_name("BRANCH")
                .help("revision to check out after clone; required in sparse mode"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("live-stream subprocess output"),
        )
        .arg(
            Arg::new("print_git_errors")
                .long("print_git_errors")
                .action(ArgAction::SetTrue)
                .help("emit captured output only when a command fails"),
        )
        .arg(
            Arg::new("color")
                .short('c')
                .long("color")
                .action(ArgAction::SetTrue)
                .help("colorise status lines"),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("CONFIG")
                .action(ArgAction::Append)
                .help("extra --config passed to the outer clone"),
        )
        .arg(
            Arg::new("lock_timeout")
                .long("lock-timeout")
                .value_name("N")
                .value_parser(clap::value_parser!(u64))
                .default_value("0")
                .help("seconds for file lock acquisition; 0 waits forever"),
        )
        .arg(
            Arg::new("pre_clone_hook")
                .long("pre-clone-hook")
                .value_name("SCRIPT")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::FilePath)
                .help("executable invoked as `SCRIPT URL MIRROR ATTEMPT_NUMBER` before the first mirror clone"),
        )
        .arg(
            Arg::new("sparse_paths")
                .long("sparse-paths")
                .value_name("PATHS")
                .help("comma-separated; enables cone-mode sparse checkout"),
        )
        .arg(
            Arg::new("cache_dir")
                .long("cache-dir")
                .value_name("DIR")
                .value_parser(clap::value_parser!(Utf8PathBuf))
                .value_hint(ValueHint::DirPath)
                .env("REFERENCE_REPO_DIR")
                .help("reference-mirror cache root"),
        )
        .arg(
            Arg::new("jobs")
                .short('j')
                .long("jobs")
                .value_name("N")
                .value_parser(clap::value_parser!(usize))
                .help("number of submodules fetched at the same time"),
        )
}

fn main() -> ExitCode {
    let matches = clap().get_matches();

    let Some(repository) = matches.get_one::<String>("repository") else {
        eprintln!("usage: git-fastclone <url> [<path>] [options]");
        return ExitCode::from(129);
    };

    let dest = matches.get_one::<Utf8PathBuf>("path").cloned();
    let sparse_paths: Option<Vec<String>> = matches.get_one::<String>("sparse_paths").map(|s| {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    });

    let opts = Options {
        cache_root: matches
            .get_one::<Utf8PathBuf>("cache_dir")
            .cloned()
            .unwrap_or_else(git_fastclone::default_cache_root),
        branch: matches.get_one::<String>("branch").cloned(),
        verbose: matches.get_flag("verbose"),
        print_on_failure: matches.get_flag("print_git_errors"),
        config: matches
            .get_many::<String>("config")
            .map(|v| v.cloned().collect()),
        lock_timeout: Duration::from_secs(*matches.get_one::<u64>("lock_timeout").unwrap()),
        pre_clone_hook: matches.get_one::<Utf8PathBuf>("pre_clone_hook").cloned(),
        sparse_paths,
        jobs: matches.get_one::<usize>("jobs").copied(),
    };

    match git_fastclone::clone(repository, dest.as_ref(), opts) {
        Ok(_) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("git-fastclone: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &Error) -> u8 {
    match err {
        Error::Exec(e) => match e.status {
            ExitStatusKind::Code(c) => c.rem_euclid(256) as u8,
            _ => 1,
        },
        _ => 1,
    }
}
