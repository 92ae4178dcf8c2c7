/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Layered configuration for everything the proxy's process bootstrap needs
//! beyond the handful of per-invocation flags `clap` owns directly: where the
//! sketch and its build artifacts live, which board it targets, and how to
//! find the build tool and clangd.
//!
//! Layers apply in increasing priority: built-in defaults, then
//! `~/.config/catenary/config.toml`, then an explicit `--config` file, then
//! `ARDUINO_LS_`-prefixed environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Everything the binary entry point needs to bootstrap the proxy, beyond
/// argv positionals that `clap` already owns.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Fully qualified board name passed to the build tool (e.g. `arduino:avr:uno`).
    pub fqbn: String,

    /// Scratch directory the build tool writes its output into.
    #[serde(default = "default_build_root")]
    pub build_root: PathBuf,

    /// The build tool executable (conventionally `arduino-cli`).
    #[serde(default = "default_build_command")]
    pub build_command: String,

    /// Extra arguments always passed to the build tool.
    #[serde(default)]
    pub build_args: Vec<String>,

    /// Path to the clangd executable.
    #[serde(default = "default_clangd_path")]
    pub clangd_path: PathBuf,

    /// Extra arguments always passed to clangd.
    #[serde(default)]
    pub clangd_args: Vec<String>,

    /// Log verbosity, as a `tracing_subscriber::EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_build_root() -> PathBuf {
    std::env::temp_dir().join("arduino-language-server")
}

fn default_build_command() -> String {
    "arduino-cli".to_string()
}

fn default_clangd_path() -> PathBuf {
    PathBuf::from("clangd")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Loads configuration from defaults, the user config directory, an
    /// optional explicit file, and `ARDUINO_LS_`-prefixed environment
    /// variables, in that increasing order of priority.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit config file cannot be read, or if the
    /// merged configuration is missing a required field (`fqbn`) or fails to
    /// deserialize.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("build_root", default_build_root().to_string_lossy().into_owned())?
            .set_default("build_command", default_build_command())?
            .set_default("clangd_path", default_clangd_path().to_string_lossy().into_owned())?
            .set_default("log_level", default_log_level())?;

        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("catenary").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("ARDUINO_LS"));

        let config = builder.build().context("failed to build configuration")?;
        config.try_deserialize().context(
            "failed to deserialize configuration (is `fqbn` set, via config file or ARDUINO_LS_FQBN?)",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn loads_fqbn_from_an_explicit_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, r#"fqbn = "arduino:avr:uno""#).expect("write");

        let config = Config::load(Some(file.path().to_path_buf())).expect("load");
        assert_eq!(config.fqbn, "arduino:avr:uno");
        assert_eq!(config.build_command, "arduino-cli");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn explicit_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            r#"fqbn = "esp32:esp32:esp32"
build_command = "/opt/arduino-cli""#
        )
        .expect("write");

        let config = Config::load(Some(file.path().to_path_buf())).expect("load");
        assert_eq!(config.fqbn, "esp32:esp32:esp32");
        assert_eq!(config.build_command, "/opt/arduino-cli");
    }

    #[test]
    fn missing_fqbn_is_an_error() {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let result = Config::load(Some(file.path().to_path_buf()));
        assert!(result.is_err());
    }
}
