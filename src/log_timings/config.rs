// Log Timings - Map access log request timings to web application routes
//
// Copyright 2018 TSH Labs
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.
//

//! Settings file and command line overrides.

use crate::routes::{DecoratorConfig, RouteConfig, RoutingTable};
use crate::types::{LogTimingsError, LogTimingsResult};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::debug;

pub const CONFIG_ENV_VAR: &str = "LOG_TIMINGS_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "log-timings.toml";
const CUSTOM_SETTINGS_KEY: &str = "custom_settings";

/// Everything that can be set in the settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Apache `LogFormat` used when none is given on the command line
    pub log_format: Option<String>,
    /// Decorators to patch out in addition to those given on the command line
    pub patch_out: Vec<String>,
    /// `KEY VALUE` overrides applied before those from the command line
    pub custom_settings: Vec<(String, String)>,
    /// Maximum number of resolved and unresolved URLs to remember, each
    pub cache_capacity: Option<usize>,
    pub routes: Vec<RouteConfig>,
    pub decorators: Vec<DecoratorConfig>,
}

impl Settings {
    /// Load settings from `path` (if any), then apply overrides from the
    /// file's own `custom_settings` followed by `overrides`.
    pub fn load(path: Option<&Path>, overrides: &[(String, String)]) -> LogTimingsResult<Self> {
        let mut table = match path {
            Some(p) => {
                let contents = fs::read_to_string(p).map_err(|e| LogTimingsError::input(p, e))?;
                debug!(path = %p.display(), "loaded settings file");
                toml::from_str::<Table>(&contents)?
            }
            None => Table::new(),
        };

        let from_file: Vec<(String, String)> = match table.get(CUSTOM_SETTINGS_KEY) {
            Some(v) => v.clone().try_into()?,
            None => Vec::new(),
        };

        for (key, value) in from_file.iter().chain(overrides) {
            set_key(&mut table, key, value)?;
        }

        Ok(Value::Table(table).try_into()?)
    }

    /// Build the routing table described by these settings, with every
    /// decorator from `patch_out` and `extra_patch_out` unwrapped.
    pub fn routing_table(&self, extra_patch_out: &[String]) -> LogTimingsResult<RoutingTable> {
        let mut table = RoutingTable::new(&self.routes, &self.decorators)?;
        for name in self.patch_out.iter().chain(extra_patch_out) {
            table.patch_out(name.as_str());
        }

        Ok(table)
    }
}

/// Pick the settings file to use: the one given explicitly, the one named
/// by the environment, or the default file if it exists in the working
/// directory.
pub fn settings_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        return Some(PathBuf::from(p));
    }

    if let Ok(p) = env::var(CONFIG_ENV_VAR) {
        if !p.is_empty() {
            return Some(PathBuf::from(p));
        }
    }

    let default = PathBuf::from(DEFAULT_CONFIG_FILE);
    if default.is_file() {
        Some(default)
    } else {
        None
    }
}

/// Set the (possibly dotted) `key` in `table` to `value`, creating any
/// intermediate tables needed.
fn set_key(table: &mut Table, key: &str, value: &str) -> LogTimingsResult<()> {
    let mut parts: Vec<&str> = key.split('.').collect();
    let last = parts.pop().filter(|s| !s.is_empty()).ok_or_else(|| invalid_key(key))?;

    let mut current = table;
    for part in parts {
        let entry = current
            .entry(part.to_string())
            .or_insert(Value::Table(Table::new()));

        current = match entry {
            Value::Table(t) => t,
            _ => return Err(invalid_key(key)),
        };
    }

    current.insert(last.to_string(), parse_value(value));
    Ok(())
}

fn invalid_key(key: &str) -> LogTimingsError {
    LogTimingsError::ConfigError(format!("cannot override setting '{}'", key))
}

/// Interpret `value` as a TOML value (number, boolean, array, ...) if it is
/// one, otherwise use it as a plain string.
fn parse_value(value: &str) -> Value {
    toml::from_str::<Table>(&format!("v = {}", value))
        .ok()
        .and_then(|mut t| t.remove("v"))
        .unwrap_or_else(|| Value::String(value.to_string()))
}
