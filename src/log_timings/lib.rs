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

//! Map request timings from web server access logs to the routes of the
//! web application that handled each request.
//!
//! Log files are read line by line (`walk`, `io`), each line is parsed with a
//! compiled Apache `LogFormat` (`parser`), the requested URL is resolved to a
//! named route through a memoizing cache (`resolve`, `routes`), and matching
//! requests are written out as TSV or JSON (`emit`). `pipeline` ties these
//! together.

#![forbid(unsafe_code)]

extern crate failure;
#[macro_use]
extern crate failure_derive;

pub mod buf;
pub mod config;
pub mod emit;
pub mod io;
pub mod parser;
pub mod pipeline;
pub mod resolve;
pub mod routes;
pub mod types;
pub mod walk;
