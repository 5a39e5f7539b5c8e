//
//

//! In-memory buffer for output formats that can only be written all at once.

use crate::types::OutputRecord;

#[derive(Debug, Default)]
pub struct RecordBuffer {
    buf: Vec<OutputRecord>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        RecordBuffer { buf: Vec::new() }
    }

    pub fn push(&mut self, record: OutputRecord) -> usize {
        self.buf.push(record);
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn records(&self) -> &[OutputRecord] {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
