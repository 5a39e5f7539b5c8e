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

use clap::{crate_version, App, Arg, ArgMatches};
use log_timings::config::{settings_path, Settings};
use log_timings::pipeline::{run, RunOptions};
use log_timings::types::LogTimingsResult;
use std::path::PathBuf;
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() {
    let matches = App::new("log-timings")
        .version(crate_version!())
        .about("\nMap request timings from access logs to the web application routes that handled them.")
        .arg(
            Arg::with_name("input-source")
                .short("i")
                .long("input-source")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Log file or directory of log files to parse. May be repeated."),
        )
        .arg(
            Arg::with_name("output")
                .short("o")
                .long("output")
                .alias("output-file")
                .takes_value(true)
                .help("File to write results to."),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .takes_value(true)
                .help("Apache log format of the input, e.g. '%h %l %u %t \"%r\" %>s %b %D'. Defaults to log_format from settings."),
        )
        .arg(
            Arg::with_name("patch-out")
                .short("p")
                .long("patch-out")
                .takes_value(true)
                .multiple(true)
                .number_of_values(1)
                .help("Decorator to unwrap before resolving routes. May be repeated."),
        )
        .arg(
            Arg::with_name("setting")
                .short("s")
                .long("setting")
                .takes_value(true)
                .multiple(true)
                .number_of_values(2)
                .value_names(&["KEY", "VALUE"])
                .help("Override a settings value for this run. May be repeated."),
        )
        .arg(
            Arg::with_name("zip")
                .short("z")
                .long("zip")
                .help("gzip the output file."),
        )
        .arg(
            Arg::with_name("output-format")
                .short("F")
                .long("output-format")
                .takes_value(true)
                .possible_values(&["tsv", "json"])
                .default_value("tsv")
                .help("Output format."),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .takes_value(true)
                .help("Settings file. Defaults to $LOG_TIMINGS_CONFIG or ./log-timings.toml if present."),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .multiple(true)
                .help("Log more. May be repeated. RUST_LOG takes precedence."),
        )
        .arg(
            Arg::with_name("inputs")
                .multiple(true)
                .help("More log files or directories to parse."),
        )
        .get_matches();

    init_logging(matches.occurrences_of("verbose"));

    if let Err(e) = run_command(&matches) {
        eprintln!("log-timings: {}", e);
        process::exit(1);
    }
}

fn init_logging(verbosity: u64) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(matches: &ArgMatches) -> LogTimingsResult<()> {
    let overrides = setting_pairs(matches);
    let settings = Settings::load(settings_path(matches.value_of("config")).as_deref(), &overrides)?;

    let inputs: Vec<PathBuf> = values(matches, "input-source")
        .chain(values(matches, "inputs"))
        .map(PathBuf::from)
        .collect();

    let options = RunOptions {
        inputs,
        output: matches.value_of("output").map(PathBuf::from),
        format: matches.value_of("format").map(String::from),
        output_format: matches.value_of("output-format").unwrap_or("tsv").parse()?,
        zip: matches.is_present("zip"),
        patch_out: values(matches, "patch-out").map(String::from).collect(),
    };

    let summary = run(&settings, &options)?;
    let stats = summary.pipeline;
    info!(
        files = stats.files,
        unreadable_files = stats.unreadable_files,
        lines = stats.lines,
        unparsed = stats.unparsed,
        unresolved = stats.unresolved,
        records = stats.records,
        distinct_urls_resolved = summary.resolved_urls,
        distinct_urls_unresolved = summary.unresolved_urls,
        resolver_calls = summary.resolver_calls,
        "finished"
    );

    Ok(())
}

fn values<'a>(matches: &'a ArgMatches<'a>, name: &str) -> impl Iterator<Item = &'a str> + 'a {
    matches.values_of(name).into_iter().flatten()
}

fn setting_pairs(matches: &ArgMatches) -> Vec<(String, String)> {
    let flat: Vec<&str> = values(matches, "setting").collect();
    flat.chunks(2)
        .filter(|c| c.len() == 2)
        .map(|c| (c[0].to_string(), c[1].to_string()))
        .collect()
}
