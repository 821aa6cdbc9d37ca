//! Chunked reader over newline-terminated records.
//!
//! Only terminated lines are yielded. A trailing fragment without a line
//! boundary is left unread so the offset never moves past the last
//! complete record.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

/// One complete line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    /// Line content without its terminator.
    pub text: String,
    /// 1-based line number in the file.
    pub number: u64,
    /// Byte offset of the first byte of this line.
    pub start_offset: u64,
    /// Byte offset just past the terminator.
    pub end_offset: u64,
}

pub struct LineReader {
    reader: BufReader<File>,
    offset: u64,
    line: u64,
    buf: Vec<u8>,
    incomplete_tail: bool,
}

impl LineReader {
    /// Open `path` positioned at `offset`, which is assumed to be the start
    /// of line `line + 1`.
    pub fn open(path: &Path, offset: u64, line: u64, chunk_bytes: usize) -> io::Result<Self> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Self {
            reader: BufReader::with_capacity(chunk_bytes.max(1), file),
            offset,
            line,
            buf: Vec::new(),
            incomplete_tail: false,
        })
    }

    /// Next complete line, or `None` at EOF or at an unterminated tail.
    pub fn next_line(&mut self) -> io::Result<Option<Line>> {
        if self.incomplete_tail {
            return Ok(None);
        }
        self.buf.clear();
        let n = self.reader.read_until(b'\n', &mut self.buf)?;
        if n == 0 {
            return Ok(None);
        }
        if self.buf.last() != Some(&b'\n') {
            self.incomplete_tail = true;
            return Ok(None);
        }

        let start_offset = self.offset;
        self.offset += n as u64;
        self.line += 1;
        let text = String::from_utf8_lossy(&self.buf)
            .trim_end_matches(|c| c == '\n' || c == '\r')
            .to_string();
        Ok(Some(Line {
            text,
            number: self.line,
            start_offset,
            end_offset: self.offset,
        }))
    }

    /// Offset just past the last complete line read.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Number of complete lines consumed, counted from the file start.
    pub fn line(&self) -> u64 {
        self.line
    }

    /// Whether reading stopped at an unterminated fragment.
    pub fn has_incomplete_tail(&self) -> bool {
        self.incomplete_tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(reader: &mut LineReader) -> Vec<Line> {
        let mut out = Vec::new();
        while let Some(l) = reader.next_line().unwrap() {
            out.push(l);
        }
        out
    }

    #[test]
    fn stops_before_unterminated_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "one\ntwo\r\nthr").unwrap();

        let mut r = LineReader::open(&path, 0, 0, 4).unwrap();
        let lines = collect(&mut r);
        assert_eq!(
            lines.iter().map(|l| l.text.as_str()).collect::<Vec<_>>(),
            vec!["one", "two"]
        );
        assert_eq!(r.offset(), 9);
        assert_eq!(r.line(), 2);
        assert!(r.has_incomplete_tail());
    }

    #[test]
    fn resumes_from_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.jsonl");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        let mut r = LineReader::open(&path, 4, 1, 8192).unwrap();
        let lines = collect(&mut r);
        assert_eq!(lines[0].text, "two");
        assert_eq!(lines[0].number, 2);
        assert_eq!(lines[0].start_offset, 4);
        assert_eq!(lines[1].end_offset, 14);
        assert!(!r.has_incomplete_tail());
    }
}
