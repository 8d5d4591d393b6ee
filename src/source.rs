use std::io::BufRead;

use anyhow::{Context, Result};

use crate::geometry::Landmark;

/// Landmarks for one frame, `None` when no person was detected.
pub type Frame = Option<Vec<Landmark>>;

pub trait PoseSource {
    /// Next frame, or `None` at the end of the stream.
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Reads one JSON frame per line: `null`, or an array of `[x, y]` /
/// `[x, y, visibility]` rows in landmark order. Lines that fail to parse
/// are logged and skipped.
pub struct JsonLinesSource<R> {
    reader: R,
    line: String,
    line_no: usize,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: String::new(),
            line_no: 0,
        }
    }

    fn read_line(&mut self) -> Result<Option<&str>> {
        self.line.clear();
        let read = self
            .reader
            .read_line(&mut self.line)
            .with_context(|| format!("Failed to read frame {}", self.line_no + 1))?;
        if read == 0 {
            return Ok(None);
        }
        self.line_no += 1;
        Ok(Some(self.line.trim()))
    }
}

pub fn parse_frame(line: &str) -> Result<Frame> {
    serde_json::from_str(line).context("Invalid frame")
}

impl<R: BufRead> PoseSource for JsonLinesSource<R> {
    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let line = match self.read_line() {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => {
                    tracing::error!(target: "sentinel::monitor", "{:#}", e);
                    return None;
                }
            };
            if line.is_empty() {
                continue;
            }
            match parse_frame(line) {
                Ok(frame) => return Some(frame),
                Err(e) => {
                    tracing::warn!(
                        target: "sentinel::monitor",
                        "Skipping frame on line {}: {:#}",
                        self.line_no,
                        e
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn reads_frames_and_skips_garbage() {
        let input = "null\n\n[[0.5, 0.2], [0.4, 0.3, 0.9]]\nnot json\n[[1]]\n[]\n";
        let mut source = JsonLinesSource::new(Cursor::new(input));

        assert_eq!(source.next_frame(), Some(None));
        assert_eq!(
            source.next_frame(),
            Some(Some(vec![
                Landmark::new(0.5, 0.2),
                Landmark {
                    x: 0.4,
                    y: 0.3,
                    visibility: 0.9
                }
            ]))
        );
        assert_eq!(source.next_frame(), Some(Some(Vec::new())));
        assert_eq!(source.next_frame(), None);
    }
}
