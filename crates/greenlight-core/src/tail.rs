//! Line Follower
//!
//! Both the bridge tailer and the transcript streamer follow growing
//! append-only files and must only ever forward whole lines: a line is
//! complete once its `\n` has been written, and anything after the last
//! newline is a partial that stays buffered until more bytes arrive.

/// Incremental newline splitter over a byte stream.
///
/// `feed` returns every line completed by the chunk, stripped of its
/// trailing `\r?\n`. Empty lines are dropped. Trailing bytes without a
/// newline are retained as the partial for the next call.
#[derive(Debug, Default)]
pub struct LineFollower {
    partial: Vec<u8>,
}

impl LineFollower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a chunk, returning the newline-terminated lines it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let mut line = std::mem::take(&mut self.partial);
            line.extend_from_slice(&rest[..pos]);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.is_empty() {
                lines.push(line);
            }
            rest = &rest[pos + 1..];
        }
        self.partial.extend_from_slice(rest);
        lines
    }

    /// Take whatever is buffered without a terminating newline. Used by the
    /// bridge tailer's drain pass as a best-effort final frame.
    pub fn take_partial(&mut self) -> Option<Vec<u8>> {
        if self.partial.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.partial))
        }
    }
}
