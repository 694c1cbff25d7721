//! `bayesd` binary
//!
//! Serves a replica, or with `-i` (or when invoked as `bayes-index`)
//! writes an index of it and exits.

use std::ffi::OsStr;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use bayes_durability::ReplicaPaths;
use bayes_engine::BayesStore;
use bayes_server::cli::{build_cli, CliArgs};
use bayes_server::logging::{self, LogFile};
use bayes_server::{ExitStatus, Server, ServerError, Signals};
use tracing::{error, info};

fn invoked_as_indexer() -> bool {
    std::env::args_os()
        .next()
        .as_deref()
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .is_some_and(|name| name.contains("bayes-index"))
}

fn build_index(args: &CliArgs, paths: ReplicaPaths) -> Result<(), ServerError> {
    let mut store = BayesStore::open_read_only(paths, args.server.engine.clone())?;
    let written = store.write_index()?;
    info!(
        target: "bayes::main",
        path = %written.path.display(),
        position = %written.position,
        size = written.size,
        "Index built"
    );
    Ok(())
}

fn serve(args: &CliArgs, paths: ReplicaPaths, log_file: Option<LogFile>) -> Result<(), ServerError> {
    let signals = Signals::new();
    signals.register()?;

    let store = BayesStore::open(paths, args.server.engine.clone())?;
    if let Some(repaired) = &store.boot().repaired {
        info!(target: "bayes::main", ?repaired, "Damaged binlog tail truncated");
    }

    let mut server = Server::bind(args.server.clone(), store, signals)?;
    if let Some(log_file) = log_file {
        server = server.with_log_file(log_file);
    }
    server.run()
}

fn run(args: CliArgs) -> anyhow::Result<ExitStatus> {
    let log_file = match &args.log {
        Some(path) => Some(
            LogFile::open(path).with_context(|| format!("opening log file {}", path.display()))?,
        ),
        None => None,
    };
    logging::init(args.verbosity, log_file.clone())
        .map_err(|e| anyhow::anyhow!("installing log subscriber: {e}"))?;

    let paths = match ReplicaPaths::from_arg(&args.replica) {
        Ok(paths) => paths,
        Err(e) => {
            error!(target: "bayes::main", error = %e, "Bad replica path");
            return Ok(ExitStatus::Usage);
        }
    };

    let outcome = if args.index_mode {
        build_index(&args, paths)
    } else {
        serve(&args, paths, log_file)
    };

    match outcome {
        Ok(()) => Ok(ExitStatus::Clean),
        Err(e) => {
            error!(target: "bayes::main", error = %e, "Fatal");
            Ok(e.exit_status())
        }
    }
}

fn main() -> ExitCode {
    let matches = build_cli().get_matches();
    let args = CliArgs::from_matches(&matches, invoked_as_indexer());

    match run(args) {
        Ok(status) => status.into(),
        Err(e) => {
            eprintln!("bayesd: {e:#}");
            ExitStatus::Failure.into()
        }
    }
}
