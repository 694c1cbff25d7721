//! Command line
//!
//! `bayesd [options] <index-file-or-prefix>`. Invoked under a name
//! containing `bayes-index` (or with `-i`) the binary builds an index and
//! exits instead of serving.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use bayes_durability::BinlogConfig;
use bayes_engine::{EngineConfig, DEFAULT_BUCKET_COUNT};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};

use crate::config::ServerConfig;

/// Build the command line parser.
pub fn build_cli() -> Command {
    Command::new("bayesd")
        .about("Durable Bayes spam classifier speaking the memcache protocol")
        .arg(
            Arg::new("replica")
                .value_name("INDEX-OR-PREFIX")
                .help("Index file, or the path prefix of a replica's files")
                .required(true)
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("memory-limit")
                .short('m')
                .long("memory-limit")
                .value_name("MIB")
                .help("Dynamic memory limit in MiB")
                .default_value("1024")
                .value_parser(value_parser!(u64).range(1..)),
        )
        .arg(
            Arg::new("disable-crc32")
                .short('D')
                .long("disable-crc32")
                .help("Skip chain CRC checks while replaying the binlog")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("index-mode")
                .short('i')
                .long("index-mode")
                .help("Write an index of the replica and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("lock-memory")
                .short('k')
                .long("lock-memory")
                .help("Lock process memory with mlockall")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("TCP port to listen on")
                .default_value("11211")
                .value_parser(value_parser!(u16)),
        )
        .arg(
            Arg::new("host")
                .short('H')
                .long("host")
                .help("Address to listen on")
                .default_value("0.0.0.0")
                .value_parser(value_parser!(IpAddr)),
        )
        .arg(
            Arg::new("max-connections")
                .short('c')
                .long("max-connections")
                .help("Open connection limit")
                .default_value("1000")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("More logging; repeat for more")
                .action(ArgAction::Count),
        )
        .arg(
            Arg::new("log")
                .short('l')
                .long("log")
                .value_name("FILE")
                .help("Log to FILE instead of stderr")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("max-binlog-size")
                .long("max-binlog-size")
                .value_name("BYTES")
                .help("Start a new binlog segment past this size")
                .default_value("1073741824")
                .value_parser(value_parser!(u64)),
        )
        .arg(
            Arg::new("aio-slots")
                .long("aio-slots")
                .help("Concurrent bucket reads")
                .default_value("64")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("buckets")
                .long("buckets")
                .help("Buckets of a replica created from scratch")
                .default_value("64")
                .value_parser(value_parser!(u32)),
        )
}

/// Parsed command line.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Index file or replica prefix
    pub replica: PathBuf,
    /// Build an index and exit
    pub index_mode: bool,
    /// `-v` count
    pub verbosity: u8,
    /// Log file
    pub log: Option<PathBuf>,
    /// Server and engine parameters
    pub server: ServerConfig,
}

impl CliArgs {
    /// Map parsed arguments onto configuration.
    ///
    /// `index_name` is true when the binary runs under an index-building
    /// name.
    pub fn from_matches(matches: &ArgMatches, index_name: bool) -> Self {
        let binlog = BinlogConfig::new()
            .with_max_segment_size(
                matches
                    .get_one::<u64>("max-binlog-size")
                    .copied()
                    .unwrap_or(1 << 30),
            )
            .with_verify_checksums(!matches.get_flag("disable-crc32"));
        let memory_mib = matches.get_one::<u64>("memory-limit").copied().unwrap_or(1024);
        let engine = EngineConfig::new()
            .with_memory_limit_mib(usize::try_from(memory_mib).unwrap_or(usize::MAX >> 20))
            .with_bucket_count(
                matches
                    .get_one::<u32>("buckets")
                    .copied()
                    .unwrap_or(DEFAULT_BUCKET_COUNT),
            )
            .with_binlog(binlog);

        let host = matches
            .get_one::<IpAddr>("host")
            .copied()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let port = matches.get_one::<u16>("port").copied().unwrap_or(11211);
        let server = ServerConfig::new()
            .with_listen(SocketAddr::new(host, port))
            .with_max_connections(
                matches
                    .get_one::<usize>("max-connections")
                    .copied()
                    .unwrap_or(1000),
            )
            .with_aio_slots(matches.get_one::<usize>("aio-slots").copied().unwrap_or(64))
            .with_lock_memory(matches.get_flag("lock-memory"))
            .with_engine(engine);

        CliArgs {
            replica: matches
                .get_one::<PathBuf>("replica")
                .cloned()
                .unwrap_or_default(),
            index_mode: index_name || matches.get_flag("index-mode"),
            verbosity: matches.get_count("verbose"),
            log: matches.get_one::<PathBuf>("log").cloned(),
            server,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        CliArgs::from_matches(&matches, false)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["bayesd", "/data/bayes"]);
        assert_eq!(args.replica, PathBuf::from("/data/bayes"));
        assert!(!args.index_mode);
        assert_eq!(args.verbosity, 0);
        assert_eq!(args.server.listen.port(), 11211);
        assert_eq!(args.server.engine.memory_limit, 1 << 30);
        assert!(args.server.engine.binlog.verify_checksums);
        assert!(args.server.validate().is_ok());
    }

    #[test]
    fn test_options() {
        let args = parse(&[
            "bayesd",
            "-m",
            "16",
            "-D",
            "-k",
            "-p",
            "12000",
            "-H",
            "127.0.0.1",
            "-c",
            "10",
            "-vv",
            "-l",
            "/tmp/bayes.log",
            "--aio-slots",
            "8",
            "/data/bayes",
        ]);
        assert_eq!(args.server.engine.memory_limit, 16 << 20);
        assert!(!args.server.engine.binlog.verify_checksums);
        assert!(args.server.lock_memory);
        assert_eq!(args.server.listen, "127.0.0.1:12000".parse().unwrap());
        assert_eq!(args.server.max_connections, 10);
        assert_eq!(args.verbosity, 2);
        assert_eq!(args.log, Some(PathBuf::from("/tmp/bayes.log")));
        assert_eq!(args.server.aio_slots, 8);
    }

    #[test]
    fn test_index_mode() {
        assert!(parse(&["bayesd", "-i", "x"]).index_mode);
        let matches = build_cli().try_get_matches_from(["bayes-index", "x"]).unwrap();
        assert!(CliArgs::from_matches(&matches, true).index_mode);
    }

    #[test]
    fn test_usage_errors() {
        assert!(build_cli().try_get_matches_from(["bayesd"]).is_err());
        assert!(build_cli()
            .try_get_matches_from(["bayesd", "-m", "0", "x"])
            .is_err());
        assert!(build_cli()
            .try_get_matches_from(["bayesd", "-p", "notaport", "x"])
            .is_err());
    }
}
