use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use host1x::Soc;

/// Where requests go.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// A Tegra DRM node (`--device`).
    Drm,
    /// The in-process host1x model.
    Emulated,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "host1x-test", version, about = "Exercise the host1x job submission path")]
struct Args {
    /// Print the available test names and exit.
    #[arg(long)]
    list: bool,

    /// Device backend to run against.
    ///
    /// Environment variable: `HOST1X_TEST_BACKEND`.
    #[arg(long, value_enum, env = "HOST1X_TEST_BACKEND", default_value_t = Backend::Drm)]
    backend: Backend,

    /// DRM node to open with the `drm` backend.
    ///
    /// Environment variable: `HOST1X_TEST_DEVICE`.
    #[arg(long, value_name = "PATH", env = "HOST1X_TEST_DEVICE")]
    device: Option<PathBuf>,

    /// SoC to assume instead of reading the device tree (`tegra210`, `t186`, ...).
    ///
    /// Environment variable: `HOST1X_TEST_SOC`.
    #[arg(long, env = "HOST1X_TEST_SOC")]
    soc: Option<Soc>,

    /// Leave out the submit performance measurement.
    #[arg(long)]
    skip_perf: bool,

    /// Log filter (tracing-subscriber EnvFilter syntax), used when `RUST_LOG` is unset.
    ///
    /// Environment variable: `HOST1X_TEST_LOG_LEVEL`.
    #[arg(long, env = "HOST1X_TEST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Only run tests whose name contains one of these strings.
    filters: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub list: bool,
    pub backend: Backend,
    /// `None` opens [`host1x::DEFAULT_DEVICE_PATH`].
    pub device: Option<PathBuf>,
    pub soc: Option<Soc>,
    pub skip_perf: bool,
    pub log_level: String,
    pub filters: Vec<String>,
}

impl Config {
    pub fn load() -> Self {
        Self::from_args(Args::parse())
    }

    fn from_args(args: Args) -> Self {
        let log_level = args
            .log_level
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "warn".to_string());

        let filters = args
            .filters
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();

        Self {
            list: args.list,
            backend: args.backend,
            device: args.device,
            soc: args.soc,
            skip_perf: args.skip_perf,
            log_level,
            filters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Config {
        let argv = std::iter::once("host1x-test").chain(argv.iter().copied());
        Config::from_args(Args::try_parse_from(argv).unwrap())
    }

    #[test]
    fn explicit_flags_are_kept() {
        let config = parse(&["--backend", "emulated", "--soc", "t186", "--skip-perf", "reloc"]);
        assert_eq!(config.backend, Backend::Emulated);
        assert_eq!(config.soc, Some(Soc::Tegra186));
        assert!(config.skip_perf);
        assert_eq!(config.filters, vec!["reloc".to_string()]);
        assert_eq!(config.device, None);
    }

    #[test]
    fn bad_soc_is_a_usage_error() {
        let argv = ["host1x-test", "--soc", "tegra999"];
        assert!(Args::try_parse_from(argv).is_err());
    }
}
