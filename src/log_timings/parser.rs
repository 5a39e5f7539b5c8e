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

//! Parse access log lines described by an Apache `LogFormat` string.

use crate::types::{LogRecord, LogTimingsError, LogTimingsResult};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::{Captures, Regex};
use std::str::Chars;

const COMMON_LOG_TIMESTAMP: &str = "%d/%b/%Y:%T %z";
const COMMON_LOG_TIMESTAMP_NO_ZONE: &str = "%d/%b/%Y:%T";
const ISO_TIMESTAMP: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a single log line of a pre-determined format into the fields
/// needed to time a request.
///
/// Implementations ignore leading and trailing whitespace and will
/// remove it before attempting to parse a line.
pub trait LogLineParser {
    /// Parse the given log line into a `LogRecord`.
    ///
    /// Return an error if the line does not match the expected format
    /// or if a field in the line does not match the expected type.
    fn parse(&self, line: &str) -> LogTimingsResult<LogRecord>;
}

/// Unit a duration directive is logged in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DurationUnit {
    Seconds,
    Millis,
    Micros,
}

/// How the time a request was received is logged.
#[derive(Debug, Clone, PartialEq, Eq)]
enum TimeFormat {
    /// `%t`, the bracketed common log timestamp
    Common,
    /// `%{format}t` with a strftime format
    Custom(String),
    /// `%{sec}t`, `%{msec}t`, `%{usec}t`
    Epoch(DurationUnit),
}

/// What a single capture group in the compiled regex holds.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    RemoteHost,
    RemoteIp,
    Time(TimeFormat),
    Request,
    Method,
    UrlPath,
    Query,
    Duration(DurationUnit),
    Ignored,
}

/// Capture group positions of the first directive for each field we care about.
#[derive(Debug, Clone, Default)]
struct Positions {
    remote_host: Option<usize>,
    remote_ip: Option<usize>,
    time: Option<(usize, TimeFormat)>,
    request: Option<usize>,
    method: Option<usize>,
    url_path: Option<usize>,
    query: Option<usize>,
    duration: Option<(usize, DurationUnit)>,
}

impl Positions {
    fn record(&mut self, index: usize, field: Field) {
        match field {
            Field::RemoteHost => set_once(&mut self.remote_host, index),
            Field::RemoteIp => set_once(&mut self.remote_ip, index),
            Field::Time(fmt) => set_once(&mut self.time, (index, fmt)),
            Field::Request => set_once(&mut self.request, index),
            Field::Method => set_once(&mut self.method, index),
            Field::UrlPath => set_once(&mut self.url_path, index),
            Field::Query => set_once(&mut self.query, index),
            Field::Duration(unit) => set_once(&mut self.duration, (index, unit)),
            Field::Ignored => {}
        }
    }

    /// Make sure every `LogRecord` field can be filled in from the format.
    fn validate(&self, format: &str) -> LogTimingsResult<()> {
        let mut missing = Vec::new();
        if self.request.is_none() && self.url_path.is_none() {
            missing.push("request URL (%r or %U)");
        }
        if self.request.is_none() && self.method.is_none() {
            missing.push("request method (%r or %m)");
        }
        if self.duration.is_none() {
            missing.push("time taken (%D or %T)");
        }
        if self.remote_host.is_none() && self.remote_ip.is_none() {
            missing.push("remote host (%h or %a)");
        }
        if self.time.is_none() {
            missing.push("time received (%t)");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(LogTimingsError::FormatError(format!(
                "'{}' is missing {}",
                format,
                missing.join(", ")
            )))
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, val: T) {
    if slot.is_none() {
        *slot = Some(val);
    }
}

/// Parser for lines written by Apache (or anything else) using a `LogFormat`
/// string such as `%h %l %u %t "%r" %>s %b %D`.
///
/// The format is compiled into an anchored regular expression once, when the
/// parser is created. Compilation fails if the format uses an unknown
/// directive or does not include every field needed to build a `LogRecord`.
#[derive(Debug, Clone)]
pub struct FormatLogLineParser {
    regex: Regex,
    positions: Positions,
}

impl FormatLogLineParser {
    pub fn new(format: &str) -> LogTimingsResult<Self> {
        let (pattern, fields) = compile(format)?;
        let mut positions = Positions::default();
        for (i, field) in fields.into_iter().enumerate() {
            // Group zero is the entire match
            positions.record(i + 1, field);
        }

        positions.validate(format)?;
        Ok(FormatLogLineParser {
            regex: Regex::new(&pattern)?,
            positions,
        })
    }

    fn url_and_method(&self, matches: &Captures, line: &str) -> LogTimingsResult<(String, String)> {
        if let Some(i) = self.positions.request {
            let request = capture(matches, i, line)?;
            let mut parts = request.split_whitespace();
            let method = parts.next();
            let url = parts.next();

            return match (method, url) {
                (Some(m), Some(u)) => Ok((u.to_string(), m.to_string())),
                _ => Err(LogTimingsError::ParseError(line.to_string())),
            };
        }

        let method = self
            .positions
            .method
            .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))
            .and_then(|i| capture(matches, i, line))?;

        let mut url = self
            .positions
            .url_path
            .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))
            .and_then(|i| capture(matches, i, line))?
            .to_string();

        if let Some(i) = self.positions.query {
            url.push_str(capture(matches, i, line)?);
        }

        Ok((url, method.to_string()))
    }
}

impl LogLineParser for FormatLogLineParser {
    fn parse(&self, line: &str) -> LogTimingsResult<LogRecord> {
        let line = line.trim();
        let matches = self
            .regex
            .captures(line)
            .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))?;

        let (url, method) = self.url_and_method(&matches, line)?;

        let host_index = self
            .positions
            .remote_host
            .or(self.positions.remote_ip)
            .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))?;
        let client_address = capture(&matches, host_index, line)?.to_string();

        let duration_us = match self.positions.duration {
            Some((i, unit)) => parse_duration(&matches, i, line, unit)?,
            None => return Err(LogTimingsError::ParseError(line.to_string())),
        };

        let timestamp = match self.positions.time {
            Some((i, ref fmt)) => parse_timestamp(&matches, i, line, fmt)?,
            None => return Err(LogTimingsError::ParseError(line.to_string())),
        };

        Ok(LogRecord {
            url,
            duration_us,
            method,
            client_address,
            timestamp,
        })
    }
}

/// Turn a `LogFormat` string into a regular expression and the meaning of
/// each of its capture groups, in order.
fn compile(format: &str) -> LogTimingsResult<(String, Vec<Field>)> {
    let mut pattern = String::from("^");
    let mut fields = Vec::new();
    let mut literal = String::new();
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }

        let (field, regex) = directive(&mut chars, format)?;
        if let Some(f) = field {
            pattern.push_str(&regex::escape(&literal));
            literal.clear();
            pattern.push('(');
            pattern.push_str(regex);
            pattern.push(')');
            fields.push(f);
        } else {
            // %% is a literal percent sign
            literal.push('%');
        }
    }

    pattern.push_str(&regex::escape(&literal));
    pattern.push('$');
    Ok((pattern, fields))
}

/// Consume a single directive following a `%` and return what it captures
/// along with the (group free) regex that matches its value. `None` is
/// returned for the `%%` escape.
fn directive(chars: &mut Chars, format: &str) -> LogTimingsResult<(Option<Field>, &'static str)> {
    let mut argument: Option<String> = None;

    loop {
        let c = chars
            .next()
            .ok_or_else(|| LogTimingsError::FormatError(format!("'{}' ends with an incomplete directive", format)))?;

        let res = match c {
            '%' if argument.is_none() => (None, ""),
            // Status code conditions and original/final request modifiers
            '<' | '>' | '!' | ',' | '0'..='9' => continue,
            '{' => {
                let arg: String = chars.by_ref().take_while(|&c| c != '}').collect();
                argument = Some(arg);
                continue;
            }
            'h' => (Some(Field::RemoteHost), r"\S+"),
            'a' => (Some(Field::RemoteIp), r"\S+"),
            't' => return time_directive(argument, format),
            'r' => (Some(Field::Request), r".*?"),
            'm' => (Some(Field::Method), r"\S+"),
            'U' => (Some(Field::UrlPath), r"\S+"),
            'q' => (Some(Field::Query), r"\S*"),
            'D' => (Some(Field::Duration(DurationUnit::Micros)), r"-|\d+"),
            'T' => return duration_directive(argument, format),
            's' => (Some(Field::Ignored), r"-|\d{3}"),
            'b' | 'B' | 'I' | 'O' | 'S' | 'k' => (Some(Field::Ignored), r"-|\d+"),
            'l' | 'u' | 'H' | 'v' | 'V' | 'p' | 'P' | 'A' | 'f' | 'L' | 'R' => (Some(Field::Ignored), r"\S+"),
            'X' => (Some(Field::Ignored), r"[Xx+\-]"),
            'i' | 'o' | 'e' | 'n' | 'C' | '^' if argument.is_some() || c == '^' => {
                if c == '^' {
                    // %{Name}^ti and %{Name}^to trailers
                    chars.next();
                    chars.next();
                }
                (Some(Field::Ignored), r".*?")
            }
            other => {
                return Err(LogTimingsError::FormatError(format!(
                    "'{}' contains unsupported directive %{}",
                    format, other
                )))
            }
        };

        return Ok(res);
    }
}

fn time_directive(argument: Option<String>, format: &str) -> LogTimingsResult<(Option<Field>, &'static str)> {
    let arg = match argument {
        None => return Ok((Some(Field::Time(TimeFormat::Common)), r"\[[^\]]+\]")),
        Some(a) => a,
    };

    let arg = arg
        .trim_start_matches("begin:")
        .trim_start_matches("end:")
        .to_string();

    let res = match arg.as_str() {
        "sec" => (Some(Field::Time(TimeFormat::Epoch(DurationUnit::Seconds))), r"\d+"),
        "msec" => (Some(Field::Time(TimeFormat::Epoch(DurationUnit::Millis))), r"\d+"),
        "usec" => (Some(Field::Time(TimeFormat::Epoch(DurationUnit::Micros))), r"\d+"),
        "msec_frac" | "usec_frac" => (Some(Field::Ignored), r"\d+"),
        "" => {
            return Err(LogTimingsError::FormatError(format!(
                "'{}' has an empty time format",
                format
            )))
        }
        _ => (Some(Field::Time(TimeFormat::Custom(arg))), r".+?"),
    };

    Ok(res)
}

fn duration_directive(argument: Option<String>, format: &str) -> LogTimingsResult<(Option<Field>, &'static str)> {
    match argument.as_ref().map(String::as_str) {
        None | Some("s") => Ok((Some(Field::Duration(DurationUnit::Seconds)), r"-|\d+(?:\.\d+)?")),
        Some("ms") => Ok((Some(Field::Duration(DurationUnit::Millis)), r"-|\d+")),
        Some("us") => Ok((Some(Field::Duration(DurationUnit::Micros)), r"-|\d+")),
        Some(other) => Err(LogTimingsError::FormatError(format!(
            "'{}' uses unsupported unit '{}' for %T",
            format, other
        ))),
    }
}

/// Get the text of the regex capture identified by `index`.
///
/// Return an error if the capture was missing.
fn capture<'a>(matches: &Captures<'a>, index: usize, line: &str) -> LogTimingsResult<&'a str> {
    matches
        .get(index)
        .map(|m| m.as_str())
        .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))
}

/// Parse the regex capture identified by `index` into a number of
/// microseconds.
///
/// Return an error if the capture is missing, empty (`-`), or not a number.
fn parse_duration(matches: &Captures, index: usize, line: &str, unit: DurationUnit) -> LogTimingsResult<u64> {
    let val = empty_field(capture(matches, index, line)?)
        .ok_or_else(|| LogTimingsError::ParseError(line.to_string()))?;

    let res = match unit {
        DurationUnit::Micros => val.parse::<u64>().ok(),
        DurationUnit::Millis => val.parse::<u64>().ok().and_then(|v| v.checked_mul(1_000)),
        DurationUnit::Seconds => val
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| (v * 1_000_000.0).round() as u64),
    };

    res.ok_or_else(|| LogTimingsError::ParseError(line.to_string()))
}

/// Parse the regex capture identified by `index` into a naive ISO-8601
/// timestamp. Any zone offset in the log is dropped and the local time of
/// the server is kept.
fn parse_timestamp(matches: &Captures, index: usize, line: &str, format: &TimeFormat) -> LogTimingsResult<String> {
    let val = capture(matches, index, line)?;

    let naive = match *format {
        TimeFormat::Common => {
            let inner = val.trim_start_matches('[').trim_end_matches(']');
            parse_naive(inner, COMMON_LOG_TIMESTAMP, COMMON_LOG_TIMESTAMP_NO_ZONE)?
        }
        TimeFormat::Custom(ref fmt) => parse_naive(val, fmt, fmt)?,
        TimeFormat::Epoch(unit) => {
            let n = val
                .parse::<i64>()
                .map_err(|_| LogTimingsError::ParseError(line.to_string()))?;

            let dt = match unit {
                DurationUnit::Seconds => DateTime::<Utc>::from_timestamp(n, 0),
                DurationUnit::Millis => DateTime::<Utc>::from_timestamp_millis(n),
                DurationUnit::Micros => DateTime::<Utc>::from_timestamp_micros(n),
            };

            dt.ok_or_else(|| LogTimingsError::ParseError(line.to_string()))?
                .naive_utc()
        }
    };

    Ok(naive.format(ISO_TIMESTAMP).to_string())
}

/// Parse a timestamp that may or may not include a zone offset.
fn parse_naive(val: &str, with_zone: &str, without_zone: &str) -> LogTimingsResult<NaiveDateTime> {
    match DateTime::parse_from_str(val, with_zone) {
        Ok(dt) => Ok(dt.naive_local()),
        Err(_) => Ok(NaiveDateTime::parse_from_str(val, without_zone)?),
    }
}

/// Convert the "-" character that represents empty fields
fn empty_field(val: &str) -> Option<&str> {
    if val == "-" {
        None
    } else {
        Some(val)
    }
}

#[cfg(test)]
mod tests {
    use super::{FormatLogLineParser, LogLineParser};
    use crate::types::LogRecord;
    use pretty_assertions::assert_eq;

    const COMMON_WITH_TIME: &str = r#"%h %l %u %t "%r" %>s %b %D"#;
    const COMBINED_WITH_TIME: &str = r#"%h %l %u %t "%r" %>s %b "%{Referer}i" "%{User-agent}i" %D"#;

    fn record(url: &str, duration_us: u64, method: &str, host: &str, timestamp: &str) -> LogRecord {
        LogRecord {
            url: url.to_string(),
            duration_us,
            method: method.to_string(),
            client_address: host.to_string(),
            timestamp: timestamp.to_string(),
        }
    }

    #[test]
    fn test_common_format_without_zone() {
        let parser = FormatLogLineParser::new(COMMON_WITH_TIME).unwrap();
        let res = parser
            .parse(r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET /accounts/login/ HTTP/1.1" 200 1234 1500"#)
            .unwrap();

        assert_eq!(
            record("/accounts/login/", 1500, "GET", "127.0.0.1", "2020-10-10T13:55:36"),
            res
        );
    }

    #[test]
    fn test_common_format_zone_dropped() {
        let parser = FormatLogLineParser::new(COMMON_WITH_TIME).unwrap();
        let res = parser
            .parse(r#"  10.0.0.5 - frank [10/Oct/2000:13:55:36 -0700] "POST /index.html?a=b HTTP/1.0" 302 - 27  "#)
            .unwrap();

        assert_eq!(
            record("/index.html?a=b", 27, "POST", "10.0.0.5", "2000-10-10T13:55:36"),
            res
        );
    }

    #[test]
    fn test_combined_format() {
        let parser = FormatLogLineParser::new(COMBINED_WITH_TIME).unwrap();
        let res = parser
            .parse(concat!(
                "192.168.1.20 - - [10/Oct/2000:13:55:36 +0000] ",
                "\"GET /articles/2003/ HTTP/1.1\" 200 2326 ",
                "\"http://www.example.com/start.html\" ",
                "\"Mozilla/4.08 [en] (Win98; I ;Nav)\" 998877"
            ))
            .unwrap();

        assert_eq!(
            record("/articles/2003/", 998877, "GET", "192.168.1.20", "2000-10-10T13:55:36"),
            res
        );
    }

    #[test]
    fn test_duration_in_seconds() {
        let parser = FormatLogLineParser::new(r#"%a %t "%r" %T"#).unwrap();
        let res = parser
            .parse(r#"::1 [01/Jan/2021:00:00:01 +0100] "GET / HTTP/2.0" 1.25"#)
            .unwrap();

        assert_eq!(1_250_000, res.duration_us);
        assert_eq!("::1", res.client_address);
        assert_eq!("2021-01-01T00:00:01", res.timestamp);
    }

    #[test]
    fn test_duration_in_millis() {
        let parser = FormatLogLineParser::new(r#"%h %t "%r" %{ms}T"#).unwrap();
        let res = parser
            .parse(r#"1.2.3.4 [01/Jan/2021:00:00:01 +0100] "GET / HTTP/2.0" 42"#)
            .unwrap();

        assert_eq!(42_000, res.duration_us);
    }

    #[test]
    fn test_path_and_query_directives() {
        let parser = FormatLogLineParser::new("%h %t %m %U%q %D").unwrap();
        let res = parser
            .parse("1.2.3.4 [01/Jan/2021:00:00:01 +0100] GET /search/?q=rust 300")
            .unwrap();

        assert_eq!("/search/?q=rust", res.url);
        assert_eq!("GET", res.method);
    }

    #[test]
    fn test_custom_time_format() {
        let parser = FormatLogLineParser::new(r#"%h [%{%Y-%m-%d %H:%M:%S}t] "%r" %D"#).unwrap();
        let res = parser
            .parse(r#"1.2.3.4 [2019-03-04 05:06:07] "GET / HTTP/1.1" 10"#)
            .unwrap();

        assert_eq!("2019-03-04T05:06:07", res.timestamp);
    }

    #[test]
    fn test_epoch_time_format() {
        let parser = FormatLogLineParser::new(r#"%h %{sec}t "%r" %D"#).unwrap();
        let res = parser.parse(r#"1.2.3.4 1602338136 "GET / HTTP/1.1" 10"#).unwrap();

        assert_eq!("2020-10-10T13:55:36", res.timestamp);
    }

    #[test]
    fn test_literal_percent() {
        let parser = FormatLogLineParser::new(r#"%h %t "%r" %D 100%%"#).unwrap();
        assert!(parser
            .parse(r#"1.2.3.4 [01/Jan/2021:00:00:01 +0100] "GET / HTTP/1.1" 10 100%"#)
            .is_ok());
    }

    #[test]
    fn test_line_does_not_match() {
        let parser = FormatLogLineParser::new(COMMON_WITH_TIME).unwrap();
        assert!(parser.parse("").is_err());
        assert!(parser.parse("this is not a log line").is_err());
        assert!(parser
            .parse(r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET / HTTP/1.1" 200 1234"#)
            .is_err());
    }

    #[test]
    fn test_bad_field_values() {
        let parser = FormatLogLineParser::new(COMMON_WITH_TIME).unwrap();
        // Missing duration
        assert!(parser
            .parse(r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "GET / HTTP/1.1" 200 1234 -"#)
            .is_err());
        // Request line without a URL
        assert!(parser
            .parse(r#"127.0.0.1 - - [10/Oct/2020:13:55:36] "-" 408 - 10"#)
            .is_err());
        // Nonsense date
        assert!(parser
            .parse(r#"127.0.0.1 - - [99/Foo/2020:13:55:36] "GET / HTTP/1.1" 200 1234 10"#)
            .is_err());
    }

    #[test]
    fn test_format_missing_fields() {
        let err = FormatLogLineParser::new(r#"%h %l %u %t "%r" %>s %b"#).unwrap_err();
        assert!(err.to_string().contains("time taken"));

        let err = FormatLogLineParser::new("%D").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("request URL"));
        assert!(msg.contains("remote host"));
        assert!(msg.contains("time received"));
    }

    #[test]
    fn test_format_unknown_directive() {
        assert!(FormatLogLineParser::new(r#"%h %t "%r" %D %Z"#).is_err());
        assert!(FormatLogLineParser::new(r#"%h %t "%r" %D %"#).is_err());
    }
}
