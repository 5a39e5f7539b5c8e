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

//! Expand a list of files and directories into the files to read.

use rand::rngs::ThreadRng;
use rand::seq::SliceRandom;
use rand::Rng;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// Iterator over every file named by a list of input paths.
///
/// Files are yielded as given. Directories are walked recursively, top-down:
/// the files directly inside a directory are yielded in a random order, then
/// each subdirectory is walked in name order. Paths that are neither a file
/// nor a directory (missing, for example) yield nothing.
pub struct FileWalker<R> {
    inputs: VecDeque<PathBuf>,
    files: VecDeque<PathBuf>,
    walk: Option<walkdir::IntoIter>,
    rng: R,
}

impl FileWalker<ThreadRng> {
    pub fn new<I, P>(inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self::with_rng(inputs, rand::rng())
    }
}

impl<R> FileWalker<R>
where
    R: Rng,
{
    /// Create a walker that shuffles directory contents using the given
    /// random number generator.
    pub fn with_rng<I, P>(inputs: I, rng: R) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        FileWalker {
            inputs: inputs.into_iter().map(Into::into).collect(),
            files: VecDeque::new(),
            walk: None,
            rng,
        }
    }

    /// Queue the files of the next directory in the walk, shuffled.
    ///
    /// Entries are sorted with files ahead of subdirectories, so the files
    /// of one directory are exactly the entries between it and the next
    /// directory entry.
    fn next_directory(&mut self) {
        let mut finished = false;

        if let Some(walk) = self.walk.as_mut() {
            let mut batch = Vec::new();
            loop {
                match walk.next() {
                    Some(Ok(entry)) => {
                        if entry.file_type().is_dir() {
                            break;
                        }

                        // Symlinks to directories are listed but never followed
                        if entry.path_is_symlink() && entry.path().is_dir() {
                            continue;
                        }

                        batch.push(entry.into_path());
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "skipping unreadable directory entry");
                    }
                    None => {
                        finished = true;
                        break;
                    }
                }
            }

            batch.shuffle(&mut self.rng);
            self.files.extend(batch);
        }

        if finished {
            self.walk = None;
        }
    }
}

fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    a.file_type()
        .is_dir()
        .cmp(&b.file_type().is_dir())
        .then_with(|| a.file_name().cmp(b.file_name()))
}

impl<R> Iterator for FileWalker<R>
where
    R: Rng,
{
    type Item = PathBuf;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(file) = self.files.pop_front() {
                return Some(file);
            }

            if self.walk.is_some() {
                self.next_directory();
                continue;
            }

            let input = self.inputs.pop_front()?;
            if input.is_file() {
                return Some(input);
            } else if input.is_dir() {
                self.walk = Some(WalkDir::new(input).follow_links(false).sort_by(files_first).into_iter());
            }
        }
    }
}
