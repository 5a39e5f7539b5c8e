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

//! Adapters for reading (possibly compressed) log files and writing
//! (possibly compressed) results.

use crate::types::{LogTimingsError, LogTimingsResult};
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::vec;

const DEFAULT_BUF_INPUT_BYTES: usize = 64 * 1024;
const DEFAULT_BUF_OUTPUT_BYTES: usize = 64 * 1024;
const GZIP_SUFFIX: &str = ".gz";

/// Read every line of the file at `path` into memory, stripped of leading
/// and trailing whitespace.
///
/// Files with a `.gz` suffix are decompressed. The file is closed before
/// this function returns. Bytes that are not valid UTF-8 are replaced
/// rather than treated as an error since access logs routinely contain
/// whatever garbage clients send.
pub fn read_lines<P>(path: P) -> LogTimingsResult<vec::IntoIter<String>>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| LogTimingsError::input(path, e))?;
    let mut reader = BufReader::with_capacity(DEFAULT_BUF_INPUT_BYTES, file);

    let mut bytes = Vec::new();
    let res = if is_gzip(path) {
        MultiGzDecoder::new(reader).read_to_end(&mut bytes)
    } else {
        reader.read_to_end(&mut bytes)
    };

    res.map_err(|e| LogTimingsError::input(path, e))?;
    Ok(split_lines(&bytes).into_iter())
}

fn is_gzip(path: &Path) -> bool {
    path.to_str().map(|s| s.ends_with(GZIP_SUFFIX)).unwrap_or(false)
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(|line| line.trim().to_string())
        .collect()
}

enum Sink<W>
where
    W: Write,
{
    Plain(BufWriter<W>),
    Gzip(GzEncoder<BufWriter<W>>),
}

/// Buffered `Write` implementation for results that optionally compresses
/// everything written to it with gzip.
///
/// Callers must call `.finish()` once done writing, which flushes buffers and
/// writes the gzip trailer when compression is enabled.
pub struct OutputWriter<W>
where
    W: Write,
{
    sink: Sink<W>,
}

impl OutputWriter<File> {
    /// Create (or truncate) the file at `path` for writing results.
    pub fn create<P>(path: P, zip: bool) -> LogTimingsResult<Self>
    where
        P: AsRef<Path>,
    {
        let file = File::create(path)?;
        Ok(Self::new(file, zip))
    }
}

impl<W> OutputWriter<W>
where
    W: Write,
{
    pub fn new(writer: W, zip: bool) -> Self {
        Self::with_capacity(DEFAULT_BUF_OUTPUT_BYTES, writer, zip)
    }

    pub fn with_capacity(cap: usize, writer: W, zip: bool) -> Self {
        let buffered = BufWriter::with_capacity(cap, writer);
        let sink = if zip {
            Sink::Gzip(GzEncoder::new(buffered, Compression::default()))
        } else {
            Sink::Plain(buffered)
        };

        OutputWriter { sink }
    }

    /// Flush everything, complete the gzip stream if there is one, and
    /// return the underlying writer.
    pub fn finish(self) -> LogTimingsResult<W> {
        let buffered = match self.sink {
            Sink::Plain(w) => w,
            Sink::Gzip(w) => w.finish()?,
        };

        buffered.into_inner().map_err(|e| LogTimingsError::from(e.into_error()))
    }
}

impl<W> Write for OutputWriter<W>
where
    W: Write,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self.sink {
            Sink::Plain(ref mut w) => w.write(buf),
            Sink::Gzip(ref mut w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        match self.sink {
            Sink::Plain(ref mut w) => w.flush(),
            Sink::Gzip(ref mut w) => w.flush(),
        }
    }
}
