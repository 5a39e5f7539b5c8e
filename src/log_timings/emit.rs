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

//! Serialize output records as TSV or JSON.

use crate::buf::RecordBuffer;
use crate::types::{LogTimingsError, LogTimingsResult, OutputRecord, RouteArguments};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::str::FromStr;
use tracing::debug;

/// Written in the arguments column when they can't be encoded as JSON.
/// Plain string arguments always encode, so only a serializer failure
/// reaches this.
const ABSENT_ARGUMENTS: &str = "None";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Tsv,
    Json,
}

impl Default for OutputFormat {
    fn default() -> Self {
        OutputFormat::Tsv
    }
}

impl FromStr for OutputFormat {
    type Err = LogTimingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tsv" => Ok(OutputFormat::Tsv),
            "json" => Ok(OutputFormat::Json),
            _ => Err(LogTimingsError::ConfigError(format!("unknown output format '{}'", s))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OutputFormat::Tsv => write!(f, "tsv"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Destination for output records.
pub trait RecordEmitter {
    type Writer;

    /// Emit a single record. Implementations may buffer it until `.finish()`.
    fn emit(&mut self, record: OutputRecord) -> LogTimingsResult<()>;

    /// Write anything still buffered and return the underlying writer.
    fn finish(self) -> LogTimingsResult<Self::Writer>;
}

/// Route arguments as written in a TSV column: empty members are left out
/// so a route without arguments is just `{}`.
#[derive(Serialize)]
struct CompactArguments<'a> {
    #[serde(skip_serializing_if = "no_args")]
    args: &'a [String],
    #[serde(skip_serializing_if = "no_kwargs")]
    kwargs: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a RouteArguments> for CompactArguments<'a> {
    fn from(arguments: &'a RouteArguments) -> Self {
        CompactArguments {
            args: &arguments.args,
            kwargs: &arguments.kwargs,
        }
    }
}

fn no_args(args: &&[String]) -> bool {
    args.is_empty()
}

fn no_kwargs(kwargs: &&BTreeMap<String, String>) -> bool {
    kwargs.is_empty()
}

/// Write one tab separated line per record as soon as it is emitted.
///
/// Columns are method, URL, route name, JSON encoded route arguments,
/// timestamp, duration in microseconds, and client address.
#[derive(Debug)]
pub struct TsvEmitter<W> {
    writer: W,
}

impl<W> TsvEmitter<W>
where
    W: Write,
{
    pub fn new(writer: W) -> Self {
        TsvEmitter { writer }
    }
}

impl<W> RecordEmitter for TsvEmitter<W>
where
    W: Write,
{
    type Writer = W;

    fn emit(&mut self, record: OutputRecord) -> LogTimingsResult<()> {
        let arguments = serde_json::to_string(&CompactArguments::from(&record.url_arguments))
            .unwrap_or_else(|_| ABSENT_ARGUMENTS.to_string());

        writeln!(
            self.writer,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            record.method, record.url, record.url_name, arguments, record.datetime, record.microsec, record.ipaddr
        )?;

        Ok(())
    }

    fn finish(mut self) -> LogTimingsResult<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[derive(Serialize)]
struct LogsDocument<'a> {
    logs: &'a [OutputRecord],
}

/// Buffer every record and write them as a single `{"logs": [...]}` JSON
/// document when finished.
#[derive(Debug)]
pub struct JsonEmitter<W> {
    writer: W,
    buffer: RecordBuffer,
}

impl<W> JsonEmitter<W>
where
    W: Write,
{
    pub fn new(writer: W) -> Self {
        JsonEmitter {
            writer,
            buffer: RecordBuffer::new(),
        }
    }
}

impl<W> RecordEmitter for JsonEmitter<W>
where
    W: Write,
{
    type Writer = W;

    fn emit(&mut self, record: OutputRecord) -> LogTimingsResult<()> {
        self.buffer.push(record);
        Ok(())
    }

    fn finish(mut self) -> LogTimingsResult<W> {
        debug!(records = self.buffer.len(), "writing JSON document");
        let doc = LogsDocument {
            logs: self.buffer.records(),
        };

        serde_json::to_writer(&mut self.writer, &doc)?;
        self.buffer.clear();
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Emit every record produced by `records`, stopping at the first error.
///
/// Return the number of records emitted.
pub fn emit_all<E, I>(emitter: &mut E, records: I) -> LogTimingsResult<u64>
where
    E: RecordEmitter,
    I: IntoIterator<Item = LogTimingsResult<OutputRecord>>,
{
    let mut count = 0;
    for record in records {
        emitter.emit(record?)?;
        count += 1;
    }

    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::{emit_all, JsonEmitter, OutputFormat, RecordEmitter, TsvEmitter};
    use crate::types::{LogTimingsError, OutputRecord, RouteArguments};
    use pretty_assertions::assert_eq;
    use serde_json::Value;

    fn login_record() -> OutputRecord {
        OutputRecord {
            method: "GET".to_string(),
            url: "/accounts/login/".to_string(),
            url_name: "login".to_string(),
            url_arguments: RouteArguments::default(),
            datetime: "2020-10-10T13:55:36".to_string(),
            microsec: 1500,
            ipaddr: "127.0.0.1".to_string(),
        }
    }

    fn article_record() -> OutputRecord {
        let mut url_arguments = RouteArguments::default();
        url_arguments.kwargs.insert("year".to_string(), "2003".to_string());

        OutputRecord {
            method: "POST".to_string(),
            url: "/articles/2003/".to_string(),
            url_name: "news.article-year".to_string(),
            url_arguments,
            datetime: "2020-10-10T13:55:37".to_string(),
            microsec: 22,
            ipaddr: "10.1.1.1".to_string(),
        }
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::Tsv, "tsv".parse().unwrap());
        assert_eq!(OutputFormat::Json, "json".parse().unwrap());
        assert!("csv".parse::<OutputFormat>().is_err());
        assert_eq!("json", OutputFormat::Json.to_string());
    }

    #[test]
    fn test_tsv_lines() {
        let mut emitter = TsvEmitter::new(Vec::new());
        emitter.emit(login_record()).unwrap();
        emitter.emit(article_record()).unwrap();
        let out = String::from_utf8(emitter.finish().unwrap()).unwrap();

        assert_eq!(
            concat!(
                "GET\t/accounts/login/\tlogin\t{}\t2020-10-10T13:55:36\t1500\t127.0.0.1\n",
                "POST\t/articles/2003/\tnews.article-year\t{\"kwargs\":{\"year\":\"2003\"}}\t2020-10-10T13:55:37\t22\t10.1.1.1\n",
            ),
            out
        );
    }

    #[test]
    fn test_json_document() {
        let mut emitter = JsonEmitter::new(Vec::new());
        emitter.emit(login_record()).unwrap();
        emitter.emit(article_record()).unwrap();
        let out = emitter.finish().unwrap();

        let doc: Value = serde_json::from_slice(&out).unwrap();
        let logs = doc["logs"].as_array().unwrap();
        assert_eq!(2, logs.len());
        assert_eq!("login", logs[0]["url_name"]);
        assert_eq!(1500, logs[0]["microsec"]);
        assert_eq!("127.0.0.1", logs[0]["ipaddr"]);
        assert_eq!("2003", logs[1]["url_arguments"]["kwargs"]["year"]);
        assert_eq!(serde_json::json!({"args": [], "kwargs": {}}), logs[0]["url_arguments"]);
    }

    #[test]
    fn test_tsv_arguments_leave_out_empty_members() {
        let mut record = login_record();
        record.url_arguments.args.push("css/site.css".to_string());

        let mut emitter = TsvEmitter::new(Vec::new());
        emitter.emit(record).unwrap();
        let out = String::from_utf8(emitter.finish().unwrap()).unwrap();

        assert_eq!(Some(r#"{"args":["css/site.css"]}"#), out.split('\t').nth(3));
    }

    #[test]
    fn test_json_document_empty() {
        let emitter = JsonEmitter::new(Vec::new());
        let out = emitter.finish().unwrap();
        assert_eq!(r#"{"logs":[]}"#, String::from_utf8(out).unwrap());
    }

    #[test]
    fn test_emit_all_stops_at_error() {
        let records = vec![
            Ok(login_record()),
            Err(LogTimingsError::UnnamedRoute("/anon/".to_string())),
            Ok(article_record()),
        ];

        let mut emitter = TsvEmitter::new(Vec::new());
        assert!(emit_all(&mut emitter, records).is_err());

        let out = String::from_utf8(emitter.finish().unwrap()).unwrap();
        assert_eq!(1, out.lines().count());
    }
}
