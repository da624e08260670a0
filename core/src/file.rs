// core/src/file.rs
//
// getline-style iteration over text inputs that remembers where it is, so
// format errors can name the file and line they were found on.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{LmError, Result};

pub struct LineReader<R> {
    reader: R,
    name: String,
    line_no: usize,
}

impl LineReader<BufReader<File>> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        Ok(Self::new(BufReader::new(file), path.display().to_string()))
    }
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R, name: impl Into<String>) -> Self {
        Self {
            reader,
            name: name.into(),
            line_no: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of the line most recently returned (1-based).
    pub fn line_no(&self) -> usize {
        self.line_no
    }

    /// Next line without its terminator, or `None` at end of input.
    pub fn next_line(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        let n = self.reader.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    /// Next line that contains something other than whitespace.
    pub fn next_nonblank(&mut self) -> Result<Option<String>> {
        while let Some(line) = self.next_line()? {
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }

    /// A format error positioned at the current line.
    pub fn error(&self, message: impl Into<String>) -> LmError {
        LmError::format(self.name.clone(), self.line_no, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_line_numbers_across_blank_lines() {
        let text = "first\n\n  \nsecond\r\n";
        let mut r = LineReader::new(text.as_bytes(), "mem");
        assert_eq!(r.next_nonblank().unwrap().as_deref(), Some("first"));
        assert_eq!(r.line_no(), 1);
        assert_eq!(r.next_nonblank().unwrap().as_deref(), Some("second"));
        assert_eq!(r.line_no(), 4);
        assert!(r.next_line().unwrap().is_none());

        match r.error("bad") {
            LmError::Format { file, line, .. } => {
                assert_eq!(file, "mem");
                assert_eq!(line, 4);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
