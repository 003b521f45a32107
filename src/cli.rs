//! Command line argument and config file tools.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{Arg, ArgAction, ArgMatches, Command, Parser};
use snafu::{ResultExt as _, Snafu};

use crate::config::{create_config_file, Settings};
use crate::ServiceInfo;

const GENERATE_CONFIG_OPT_ID: &str = "generate";
const USE_CONFIG_OPT_ID: &str = "config";

/// Command line failures.
#[derive(Debug, Snafu)]
pub enum Error {
    /// The arguments did not parse (this includes `--help` and `--version`)
    #[snafu(display("{source}"))]
    ArgParse {
        /// clap's error, which also knows how to print itself and exit
        source: clap::Error,
    },

    /// The sample config could not be written, or the config could not be loaded
    #[snafu(display("{source}"))]
    Config {
        /// config error
        source: crate::Error,
    },
}

/// Default generic argument for `Cli` to be used when you do not need custom CLI arguments.
///
/// Implemented by hand so it contributes no `about` text and the service description is
/// used instead.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoArguments {}

impl clap::FromArgMatches for NoArguments {
    fn from_arg_matches(_matches: &ArgMatches) -> Result<Self, clap::Error> {
        Ok(Self {})
    }

    fn update_from_arg_matches(&mut self, _matches: &ArgMatches) -> Result<(), clap::Error> {
        Ok(())
    }
}

impl clap::CommandFactory for NoArguments {
    fn command() -> Command {
        Command::new("no-arguments")
    }

    fn command_for_update() -> Command {
        Self::command()
    }
}

impl Parser for NoArguments {}

/// What a successful parse asked for.
#[derive(Debug)]
pub enum Parsed<A> {
    /// Run the bridge with these arguments and settings
    Run(Cli<A>),
    /// A sample config was written to `path`; nothing else should happen
    Generated {
        /// where the sample went
        path: PathBuf,
    },
}

/// Parsed command line arguments and the settings they point to.
#[derive(Debug)]
pub struct Cli<A = NoArguments> {
    /// parsed custom command line arguments
    pub args: A,

    /// settings from the config file with environment overrides applied
    pub settings: Settings,
}

fn command<A: Parser>(service_info: &ServiceInfo) -> Command {
    let arg_command = A::command();

    Command::new(service_info.name)
        .version(service_info.version)
        .author(service_info.author)
        .about(
            arg_command
                .get_about()
                .map(ToString::to_string)
                .unwrap_or_else(|| service_info.description.to_owned()),
        )
        .args(arg_command.get_arguments())
        .arg(
            Arg::new(USE_CONFIG_OPT_ID)
                .required_unless_present(GENERATE_CONFIG_OPT_ID)
                .action(ArgAction::Set)
                .long("config")
                .short('c')
                .help("Specifies the toml config file to run the bridge with"),
        )
        .arg(
            Arg::new(GENERATE_CONFIG_OPT_ID)
                .action(ArgAction::Set)
                .long("generate")
                .short('g')
                .help("Generates a new default toml config file for the bridge"),
        )
}

impl<A: Parser> Cli<A> {
    /// Parses `args` (program name first), then generates or loads the config file and
    /// applies overrides from environment variables starting with `env_prefix`.
    ///
    /// # Errors
    /// - `ArgParse` for unknown or missing arguments, and for `--help`/`--version`.
    /// - `Config` if the sample cannot be written or the settings cannot be loaded.
    pub fn try_parse_from<I, T>(
        service_info: &ServiceInfo,
        env_prefix: impl AsRef<str>,
        args: I,
    ) -> Result<Parsed<A>, Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let mut arg_matches = command::<A>(service_info)
            .try_get_matches_from(args)
            .context(ArgParseSnafu)?;

        if let Some(path) = arg_matches.remove_one::<String>(GENERATE_CONFIG_OPT_ID) {
            let path = PathBuf::from(path);
            create_config_file::<Settings>(&path).context(ConfigSnafu)?;
            return Ok(Parsed::Generated { path });
        }

        Self::load(&mut arg_matches, env_prefix.as_ref()).map(Parsed::Run)
    }

    fn load(arg_matches: &mut ArgMatches, env_prefix: &str) -> Result<Self, Error> {
        let config_path = arg_matches.remove_one::<String>(USE_CONFIG_OPT_ID);
        let args = A::from_arg_matches_mut(arg_matches).context(ArgParseSnafu)?;
        let settings = Settings::load(config_path, Some(env_prefix)).context(ConfigSnafu)?;
        Ok(Self { args, settings })
    }

    /// Like [`Cli::try_parse_from`] on the process arguments, but exits the process instead
    /// of returning: with status 0 after `--generate`, `--help` or `--version`, and with a
    /// failure status and a message on stderr otherwise.
    pub fn new(service_info: &ServiceInfo, env_prefix: impl AsRef<str>) -> Self {
        match Self::try_parse_from(service_info, env_prefix, std::env::args_os()) {
            Ok(Parsed::Run(cli)) => cli,
            Ok(Parsed::Generated { path }) => {
                eprintln!("Wrote sample config to {}", path.display());
                std::process::exit(0);
            }
            Err(Error::ArgParse { source }) => source.exit(),
            Err(err) => {
                eprintln!("{err}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::error::ErrorKind;
    use figment::Jail;

    use super::*;
    use crate::broker::QoS;

    #[derive(clap::Parser, Debug)]
    /// Replays recorded traffic
    struct Replay {
        /// stop after this many messages
        #[arg(short, long, default_value_t = 10)]
        limit: u32,
    }

    fn info() -> ServiceInfo {
        ServiceInfo {
            name: "bridge",
            name_in_metrics: "bridge".to_string(),
            version: "0.0.1",
            author: "",
            description: "bridge under test",
        }
    }

    #[test]
    fn config_flag_is_required() {
        let err = Cli::<NoArguments>::try_parse_from(&info(), "CLITEST_", ["bridge"]).unwrap_err();
        let Error::ArgParse { source } = err else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(source.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn generate_writes_a_loadable_sample() {
        Jail::expect_with(|jail| {
            let parsed = Cli::<NoArguments>::try_parse_from(
                &info(),
                "CLITEST_",
                ["bridge", "--generate", "sample.toml"],
            )
            .map_err(|err| err.to_string())?;
            let Parsed::Generated { path } = parsed else {
                panic!("expected the sample to be generated");
            };
            assert!(path.ends_with("sample.toml"));

            let sample = std::fs::read_to_string(jail.directory().join("sample.toml"))
                .map_err(|err| err.to_string())?;
            assert!(sample.contains("inbound_topic"));
            Ok(())
        });
    }

    #[test]
    fn config_and_custom_arguments_are_loaded() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                "[bridge]\noutbound_qos = \"at_least_once\"\n",
            )?;
            jail.set_env("CLITEST_BRIDGE__INBOUND_TOPIC", "replay/#");

            let parsed = Cli::<Replay>::try_parse_from(
                &info(),
                "CLITEST_",
                ["bridge", "-c", "bridge.toml", "--limit", "3"],
            )
            .map_err(|err| err.to_string())?;

            let Parsed::Run(cli) = parsed else {
                panic!("expected a runnable cli");
            };
            assert_eq!(cli.args.limit, 3);
            assert_eq!(cli.settings.bridge.outbound_qos, QoS::AtLeastOnce);
            assert_eq!(cli.settings.bridge.inbound_topic, "replay/#");
            Ok(())
        });
    }

    #[test]
    fn missing_config_file_is_a_config_error() {
        let err = Cli::<NoArguments>::try_parse_from(
            &info(),
            "CLITEST_",
            ["bridge", "--config", "/nonexistent/bridge.toml"],
        )
        .unwrap_err();

        assert!(matches!(
            err,
            Error::Config {
                source: crate::Error::ConfigFileMissing { .. }
            }
        ));
    }

    #[test]
    fn custom_about_replaces_description() {
        let help = command::<Replay>(&info()).render_help().to_string();
        assert!(help.contains("Replays recorded traffic"));
        assert!(help.contains("--generate"));

        let help = command::<NoArguments>(&info()).render_help().to_string();
        assert!(help.contains("bridge under test"));
    }
}
