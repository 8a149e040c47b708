use anyhow::Result;
use clap::{builder::PossibleValuesParser, value_parser};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Debug, Clone)]
pub struct AppArgs {
    pub config_file: String,
    pub config_test: bool,
    pub log_level: String,
}

fn command() -> clap::Command {
    clap::Command::new("redmux")
        .version(crate::VERSION)
        .about("TCP relay with multiplexed, multi-link tunnels")
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Config filename")
                .default_value("config.yaml")
                .value_parser(value_parser!(String))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("log-level")
                .short('l')
                .long("log")
                .help("Set log level")
                .value_parser(PossibleValuesParser::new([
                    "error", "warn", "info", "debug", "trace",
                ]))
                .num_args(1),
        )
        .arg(
            clap::Arg::new("config-check")
                .short('t')
                .long("test")
                .help("Load and check config file then exits")
                .action(clap::ArgAction::SetTrue),
        )
}

fn app_args(args: &clap::ArgMatches) -> AppArgs {
    let config_file = args
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("config.yaml")
        .to_string();
    let config_test = args.get_flag("config-check");
    let log_level = args
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info")
        .to_string();
    AppArgs {
        config_file,
        config_test,
        log_level,
    }
}

pub fn parse_args() -> Result<AppArgs> {
    let args = app_args(&command().get_matches());
    init_logging(&args.log_level)?;
    Ok(args)
}

pub fn init_logging(log_level: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(log_level.parse()?)
                .from_env()?,
        )
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> AppArgs {
        app_args(&command().try_get_matches_from(argv).unwrap())
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["redmux"]);
        assert_eq!(args.config_file, "config.yaml");
        assert!(!args.config_test);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_flags() {
        let args = parse(&["redmux", "-c", "relay.yaml", "-l", "debug", "-t"]);
        assert_eq!(args.config_file, "relay.yaml");
        assert!(args.config_test);
        assert_eq!(args.log_level, "debug");
    }

    #[test]
    fn test_rejects_unknown_level() {
        assert!(
            command()
                .try_get_matches_from(["redmux", "-l", "loud"])
                .is_err()
        );
    }

    #[test]
    fn test_levels_are_directives() {
        for level in ["error", "warn", "info", "debug", "trace"] {
            assert!(level.parse::<tracing_subscriber::filter::Directive>().is_ok());
        }
    }
}
