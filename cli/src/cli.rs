//! Command-line arguments for `aar-fuse`.

use aar_fuse::config::DEFAULT_CONFIG_FILE;
use camino::Utf8PathBuf;
use clap::Parser;
use log::LevelFilter;

/// Fuse Android library archives and relocate their dependencies.
#[derive(Parser, Debug)]
#[command(name = "aar-fuse")]
#[command(version, about)]
#[command(long_about = concat!(
    "Fuse Android library archives and relocate their dependencies.\n\n",
    "Each [[variant]] in the configuration file names a primary library and the ",
    "secondary archives to fold into it. The fused archive keeps the primary's ",
    "manifest; classes contributed by secondaries move under the configured ",
    "relocation prefix or rules, and every reference to them is rewritten.",
))]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  Fuse every variant listed in ./aar-fuse.toml:\n",
    "    $ aar-fuse\n\n",
    "  Fuse only the release variant with debug logging:\n",
    "    $ aar-fuse --variant release -v\n\n",
    "RUST_LOG overrides the verbosity flags.",
))]
pub struct Cli {
    /// Configuration file.
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    pub config: Utf8PathBuf,

    /// Only fuse the named variant (can be repeated).
    #[arg(long = "variant", value_name = "NAME")]
    pub variants: Vec<String>,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(
        short,
        long = "verbose",
        action = clap::ArgAction::Count,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Only log errors.
    #[arg(short, long, conflicts_with = "verbosity")]
    pub quiet: bool,
}

impl Cli {
    /// Log level implied by `-v`/`-q`.
    #[must_use]
    pub const fn log_level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Error;
        }
        match self.verbosity {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// Whether `variant` was selected; no `--variant` selects everything.
    #[must_use]
    pub fn selects(&self, variant: &str) -> bool {
        self.variants.is_empty() || self.variants.iter().any(|name| name == variant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_read_the_standard_config_file() {
        let cli = Cli::parse_from(["aar-fuse"]);
        assert_eq!(cli.config, Utf8PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(cli.variants.is_empty());
        assert_eq!(cli.log_level(), LevelFilter::Info);
    }

    #[rstest]
    #[case::debug(&["aar-fuse", "-v"], LevelFilter::Debug)]
    #[case::trace(&["aar-fuse", "-vv"], LevelFilter::Trace)]
    #[case::trace_caps(&["aar-fuse", "-vvvv"], LevelFilter::Trace)]
    #[case::quiet(&["aar-fuse", "--quiet"], LevelFilter::Error)]
    fn verbosity_flags_map_to_levels(#[case] args: &[&str], #[case] expected: LevelFilter) {
        assert_eq!(Cli::parse_from(args).log_level(), expected);
    }

    #[test]
    fn quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["aar-fuse", "-q", "-v"]).is_err());
    }

    #[test]
    fn variant_filter_is_repeatable() {
        let cli = Cli::parse_from(["aar-fuse", "--variant", "debug", "--variant", "release"]);
        assert!(cli.selects("debug"));
        assert!(cli.selects("release"));
        assert!(!cli.selects("staging"));
    }

    #[test]
    fn config_path_is_configurable() {
        let cli = Cli::parse_from(["aar-fuse", "--config", "build/fuse.toml"]);
        assert_eq!(cli.config, Utf8PathBuf::from("build/fuse.toml"));
    }
}
