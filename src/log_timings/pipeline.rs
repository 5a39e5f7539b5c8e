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

//! Join parsed log lines with the routes that handled them.

use crate::config::Settings;
use crate::emit::{emit_all, JsonEmitter, OutputFormat, RecordEmitter, TsvEmitter};
use crate::io::{read_lines, OutputWriter};
use crate::parser::{FormatLogLineParser, LogLineParser};
use crate::resolve::{RouteCache, UrlResolver};
use crate::types::{LogTimingsError, LogTimingsResult, OutputRecord};
use crate::walk::FileWalker;
use std::io::Write;
use std::path::PathBuf;
use std::vec;
use tracing::{debug, info, trace, warn};

/// Apache's own status page. It is never handled by the application.
pub const SERVER_STATUS_PATH: &str = "/server-status";

/// Counts of what happened to each line read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub files: u64,
    pub unreadable_files: u64,
    pub lines: u64,
    pub unparsed: u64,
    pub server_status: u64,
    pub unresolved: u64,
    pub records: u64,
}

/// Lazy sequence of output records read from every line of every file.
///
/// Lines that don't match the log format, requests for the server status
/// page, and URLs that don't resolve to a route are skipped. An error is
/// yielded only when resolution fails in a way that should abort the whole
/// run, after which the pipeline yields nothing more.
pub struct Pipeline<'a, F, P, R>
where
    F: Iterator<Item = PathBuf>,
{
    files: F,
    lines: Option<vec::IntoIter<String>>,
    parser: &'a P,
    cache: &'a mut RouteCache<R>,
    stats: PipelineStats,
    done: bool,
}

impl<'a, F, P, R> Pipeline<'a, F, P, R>
where
    F: Iterator<Item = PathBuf>,
    P: LogLineParser,
    R: UrlResolver,
{
    pub fn new(files: F, parser: &'a P, cache: &'a mut RouteCache<R>) -> Self {
        Pipeline {
            files,
            lines: None,
            parser,
            cache,
            stats: PipelineStats::default(),
            done: false,
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    fn next_line(&mut self) -> Option<String> {
        loop {
            if let Some(line) = self.lines.as_mut().and_then(Iterator::next) {
                return Some(line);
            }

            let path = self.files.next()?;
            self.stats.files += 1;
            match read_lines(&path) {
                Ok(lines) => {
                    debug!(path = %path.display(), "reading log file");
                    self.lines = Some(lines);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable log file");
                    self.stats.unreadable_files += 1;
                    self.lines = None;
                }
            }
        }
    }
}

impl<'a, F, P, R> Iterator for Pipeline<'a, F, P, R>
where
    F: Iterator<Item = PathBuf>,
    P: LogLineParser,
    R: UrlResolver,
{
    type Item = LogTimingsResult<OutputRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        while let Some(line) = self.next_line() {
            self.stats.lines += 1;

            let record = match self.parser.parse(&line) {
                Ok(r) => r,
                Err(e) => {
                    trace!(error = %e, "skipping line that does not match format");
                    self.stats.unparsed += 1;
                    continue;
                }
            };

            if record.url == SERVER_STATUS_PATH {
                self.stats.server_status += 1;
                continue;
            }

            match self.cache.resolve_with_fallbacks(&record.url) {
                Ok(Some(route)) => {
                    self.stats.records += 1;
                    return Some(Ok(OutputRecord::new(record, &route)));
                }
                Ok(None) => {
                    self.stats.unresolved += 1;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }

        None
    }
}

/// Everything needed for a single run, typically from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub inputs: Vec<PathBuf>,
    pub output: Option<PathBuf>,
    /// Log format, overriding the one from settings
    pub format: Option<String>,
    pub output_format: OutputFormat,
    pub zip: bool,
    /// Decorators to patch out in addition to those from settings
    pub patch_out: Vec<String>,
}

/// Summary of a completed run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pipeline: PipelineStats,
    pub resolved_urls: usize,
    pub unresolved_urls: usize,
    pub resolver_calls: u64,
}

/// Parse every input log, resolve each request to a route, and write the
/// results to the output file.
///
/// Configuration problems (no output file, no inputs, no or invalid log
/// format, invalid routes) are reported before anything is read or written.
pub fn run(settings: &Settings, options: &RunOptions) -> LogTimingsResult<RunSummary> {
    let output = options.output.as_ref().ok_or_else(|| {
        LogTimingsError::ConfigError("Must provide an output file with -o/--output".to_string())
    })?;

    if options.inputs.is_empty() {
        return Err(LogTimingsError::ConfigError(
            "Must provide a location of log files to parse with -i/--input-source or as extra arguments".to_string(),
        ));
    }

    let format = options
        .format
        .as_ref()
        .or_else(|| settings.log_format.as_ref())
        .ok_or_else(|| {
            LogTimingsError::ConfigError(
                "Must provide the log format, either with log_format in settings or the -f/--format option"
                    .to_string(),
            )
        })?;

    let parser = FormatLogLineParser::new(format)?;
    let table = settings.routing_table(&options.patch_out)?;
    let mut cache = RouteCache::with_capacity(table, settings.cache_capacity);

    info!(
        inputs = options.inputs.len(),
        output = %output.display(),
        format = %options.output_format,
        zip = options.zip,
        routes = cache.resolver().len(),
        "parsing access logs"
    );

    let writer = OutputWriter::create(output, options.zip)?;
    let stats = match options.output_format {
        OutputFormat::Tsv => process(TsvEmitter::new(writer), &options.inputs, &parser, &mut cache)?,
        OutputFormat::Json => process(JsonEmitter::new(writer), &options.inputs, &parser, &mut cache)?,
    };

    let cache_stats = cache.stats();
    Ok(RunSummary {
        pipeline: stats,
        resolved_urls: cache.resolved_count(),
        unresolved_urls: cache.unresolved_count(),
        resolver_calls: cache_stats.resolver_calls,
    })
}

fn process<E, W, P, R>(
    mut emitter: E,
    inputs: &[PathBuf],
    parser: &P,
    cache: &mut RouteCache<R>,
) -> LogTimingsResult<PipelineStats>
where
    E: RecordEmitter<Writer = OutputWriter<W>>,
    W: Write,
    P: LogLineParser,
    R: UrlResolver,
{
    let mut pipeline = Pipeline::new(FileWalker::new(inputs.iter().cloned()), parser, cache);
    emit_all(&mut emitter, pipeline.by_ref())?;
    emitter.finish()?.finish()?;
    Ok(pipeline.stats())
}
