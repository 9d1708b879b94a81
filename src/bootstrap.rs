//! Default process initialization: CLI flags, config, logging and server options.

use crate::config::AppConfig;
use crate::logging::LoggingGuard;
use crate::server::ServerOptions;

/// Result of the default initialization process.
pub struct BootstrapResult {
    /// Server options derived from config and CLI.
    pub options: ServerOptions,
    /// Logging guard that must be kept alive for the lifetime of the application.
    pub logging_guard: LoggingGuard,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CliFlags {
    pub data_dir: Option<String>,
    pub config_path: Option<String>,
}

impl CliFlags {
    pub fn parse() -> Self {
        Self::parse_from(std::env::args().skip(1))
    }

    pub fn parse_from(args: impl IntoIterator<Item = String>) -> Self {
        let mut flags = Self::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--data-dir" => {
                    if let Some(val) = args.next() {
                        flags.data_dir = Some(val);
                    }
                }
                "--config" => {
                    if let Some(val) = args.next() {
                        flags.config_path = Some(val);
                    }
                }
                _ => {}
            }
        }
        flags
    }
}

/// Parse CLI, load config, init logging and derive [`ServerOptions`].
///
/// Without `--config` the built-in defaults are used.
pub fn default_init() -> Result<BootstrapResult, Box<dyn std::error::Error + Send + Sync>> {
    let cli_flags = CliFlags::parse();
    let config = match cli_flags.config_path.as_deref() {
        Some(path) => AppConfig::load_required(path)?,
        None => AppConfig::default(),
    };

    let logging_guard = crate::logging::init_logging(&config.logging)?;
    if let Some(path) = cli_flags.config_path.as_deref() {
        tracing::info!(config_path = path, "loaded config");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "sensorthings bridge starting");

    let mut options = config.to_server_options();
    if let Some(dir) = cli_flags.data_dir {
        options.data_dir = Some(dir);
    }

    Ok(BootstrapResult {
        options,
        logging_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_known_flags_and_skips_others() {
        let flags = CliFlags::parse_from(args(&["--verbose", "--config", "bridge.yaml", "--data-dir", "/var/lib/bridge"]));
        assert_eq!(flags.config_path.as_deref(), Some("bridge.yaml"));
        assert_eq!(flags.data_dir.as_deref(), Some("/var/lib/bridge"));
    }

    #[test]
    fn dangling_flag_is_ignored() {
        let flags = CliFlags::parse_from(args(&["--config"]));
        assert_eq!(flags, CliFlags::default());
    }
}
