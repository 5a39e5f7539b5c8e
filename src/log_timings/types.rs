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

//! Error type and the records that flow through the pipeline.

use chrono::format;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::Path;

pub type LogTimingsResult<T> = Result<T, LogTimingsError>;

#[derive(Fail, Debug)]
pub enum LogTimingsError {
    #[fail(display = "{}", _0)]
    IoError(#[cause] io::Error),

    #[fail(display = "{}", _0)]
    SerializationError(#[cause] SerdeError),

    #[fail(display = "{}", _0)]
    TimestampParseError(#[cause] format::ParseError),

    #[fail(display = "{}", _0)]
    RegexError(#[cause] regex::Error),

    #[fail(display = "Invalid settings file: {}", _0)]
    SettingsError(#[cause] toml::de::Error),

    #[fail(display = "Could not parse: {}", _0)]
    ParseError(String),

    #[fail(display = "Invalid log format: {}", _0)]
    FormatError(String),

    #[fail(display = "Invalid configuration: {}", _0)]
    ConfigError(String),

    #[fail(display = "Could not read {}: {}", _0, _1)]
    InputError(String, #[cause] io::Error),

    #[fail(display = "Route matching URL {} has no name", _0)]
    UnnamedRoute(String),
}

impl LogTimingsError {
    pub(crate) fn input(path: &Path, e: io::Error) -> Self {
        LogTimingsError::InputError(path.display().to_string(), e)
    }
}

impl From<io::Error> for LogTimingsError {
    fn from(e: io::Error) -> Self {
        LogTimingsError::IoError(e)
    }
}

impl From<SerdeError> for LogTimingsError {
    fn from(e: SerdeError) -> Self {
        LogTimingsError::SerializationError(e)
    }
}

impl From<format::ParseError> for LogTimingsError {
    fn from(e: format::ParseError) -> Self {
        LogTimingsError::TimestampParseError(e)
    }
}

impl From<regex::Error> for LogTimingsError {
    fn from(e: regex::Error) -> Self {
        LogTimingsError::RegexError(e)
    }
}

impl From<toml::de::Error> for LogTimingsError {
    fn from(e: toml::de::Error) -> Self {
        LogTimingsError::SettingsError(e)
    }
}

/// Fields extracted from a single access log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub url: String,
    pub duration_us: u64,
    pub method: String,
    pub client_address: String,
    /// Naive ISO-8601 time the request was received, e.g. `2020-10-10T13:55:36`
    pub timestamp: String,
}

/// Arguments captured from a URL by the route that matched it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RouteArguments {
    pub args: Vec<String>,
    pub kwargs: BTreeMap<String, String>,
}

impl RouteArguments {
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// Route a URL was resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    /// Route name, prefixed by the application namespace when there is one
    pub route_name: String,
    pub arguments: RouteArguments,
}

/// Identity of the function that handles a route, as seen by introspection.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Deserialize)]
pub struct HandlerInfo {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub line: Option<u32>,
}

impl HandlerInfo {
    pub fn new<M, F>(module: M, function: F) -> Self
    where
        M: Into<String>,
        F: Into<String>,
    {
        HandlerInfo {
            module: module.into(),
            function: function.into(),
            file: None,
            line: None,
        }
    }

    /// Where the handler is defined, as `file line N`, if known.
    pub fn location(&self) -> Option<String> {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => Some(format!("{} line {}", file, line)),
            (Some(file), None) => Some(file.clone()),
            (None, _) => None,
        }
    }

    /// Fully qualified `module.function` identifier.
    pub fn qualified_name(&self) -> String {
        if self.module.is_empty() {
            self.function.clone()
        } else {
            format!("{}.{}", self.module, self.function)
        }
    }
}

impl fmt::Display for HandlerInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.qualified_name())
    }
}

/// A log record joined with the route that handled it, ready to be written.
///
/// Field names match the keys of the JSON output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputRecord {
    pub method: String,
    pub url: String,
    pub url_name: String,
    pub url_arguments: RouteArguments,
    pub datetime: String,
    pub microsec: u64,
    pub ipaddr: String,
}

impl OutputRecord {
    pub fn new(record: LogRecord, route: &ResolvedRoute) -> Self {
        OutputRecord {
            method: record.method,
            url: record.url,
            url_name: route.route_name.clone(),
            url_arguments: route.arguments.clone(),
            datetime: record.timestamp,
            microsec: record.duration_us,
            ipaddr: record.client_address,
        }
    }
}
