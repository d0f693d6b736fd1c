//! RFC 7464 JSON-text-sequence framing.
//!
//! Snapshot and delta files are sequences of records, each introduced by
//! the ASCII record separator `0x1E` and terminated by a newline. The
//! [`JsonSeqReader`] walks such a stream and yields each record's raw JSON
//! bytes with the separator stripped and the trailing newline trimmed; it
//! never parses the JSON itself.
//!
//! The reader is synchronous over [`BufRead`]: pipelines run it on the
//! blocking path (`spawn_blocking`) and feed records through a bounded
//! channel to the async side.

use std::io::BufRead;

use thiserror::Error;

/// ASCII record separator that introduces every record.
pub const RECORD_SEPARATOR: u8 = 0x1E;

#[derive(Debug, Error)]
pub enum JsonSeqError {
    /// The stream has bytes before the first record separator.
    #[error("stream does not begin with a record separator")]
    MissingSeparator,
    /// The stream ended inside a record (no terminating newline).
    #[error("truncated record at end of stream")]
    TruncatedRecord,
    /// A separator was immediately followed by the record terminator.
    /// Consumers skip these.
    #[error("empty record")]
    EmptyRecord,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Streaming,
    Done,
}

/// Iterator over the records of a JSON-text-sequence stream.
///
/// Yields `Ok(bytes)` per record; framing problems and I/O errors are
/// yielded in-line as `Err`. The iterator is fused: after the terminal
/// `None` (or a fatal error), it stays exhausted.
pub struct JsonSeqReader<R> {
    reader: R,
    buf: Vec<u8>,
    state: State,
}

impl<R: BufRead> JsonSeqReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(8 * 1024),
            state: State::Start,
        }
    }

    /// Read up to and including the next separator. Returns the number of
    /// bytes placed in `self.buf`.
    fn fill_to_separator(&mut self) -> std::io::Result<usize> {
        self.buf.clear();
        self.reader.read_until(RECORD_SEPARATOR, &mut self.buf)
    }
}

impl<R: BufRead> Iterator for JsonSeqReader<R> {
    type Item = Result<Vec<u8>, JsonSeqError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.state {
                State::Done => return None,
                State::Start => {
                    let n = match self.fill_to_separator() {
                        Ok(n) => n,
                        Err(e) => {
                            self.state = State::Done;
                            return Some(Err(e.into()));
                        }
                    };
                    if n == 0 {
                        // Empty stream: zero records
                        self.state = State::Done;
                        return None;
                    }
                    if self.buf.as_slice() != [RECORD_SEPARATOR] {
                        self.state = State::Done;
                        return Some(Err(JsonSeqError::MissingSeparator));
                    }
                    self.state = State::Streaming;
                }
                State::Streaming => {
                    let n = match self.fill_to_separator() {
                        Ok(n) => n,
                        Err(e) => {
                            self.state = State::Done;
                            return Some(Err(e.into()));
                        }
                    };
                    if n == 0 {
                        // A separator introduced a record that never arrived
                        self.state = State::Done;
                        return Some(Err(JsonSeqError::TruncatedRecord));
                    }

                    let ends_with_separator = self.buf.last() == Some(&RECORD_SEPARATOR);
                    let raw = if ends_with_separator {
                        &self.buf[..self.buf.len() - 1]
                    } else {
                        // EOF terminates the stream after this record
                        self.state = State::Done;
                        if self.buf.last() != Some(&b'\n') {
                            return Some(Err(JsonSeqError::TruncatedRecord));
                        }
                        &self.buf[..]
                    };

                    let mut record = raw;
                    while let Some(&last) = record.last() {
                        if last != b'\n' && last != b'\r' {
                            break;
                        }
                        record = &record[..record.len() - 1];
                    }
                    if record.is_empty() {
                        return Some(Err(JsonSeqError::EmptyRecord));
                    }
                    return Some(Ok(record.to_vec()));
                }
            }
        }
    }
}
