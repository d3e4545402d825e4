use crate::protocol::TranscriptDirection;

/// Per-turn transcript buffers, one per direction. Partial fragments are
/// appended; a turn boundary clears both.
#[derive(Debug, Default)]
pub struct TranscriptAccumulator {
    input: String,
    output: String,
}

impl TranscriptAccumulator {
    /// Append a fragment and return the accumulated text for its direction.
    pub fn append(&mut self, direction: TranscriptDirection, fragment: &str) -> &str {
        let buf = match direction {
            TranscriptDirection::Input => &mut self.input,
            TranscriptDirection::Output => &mut self.output,
        };
        buf.push_str(fragment);
        buf
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Close the turn, returning `(input, output)` and leaving both empty.
    pub fn finish_turn(&mut self) -> (String, String) {
        (std::mem::take(&mut self.input), std::mem::take(&mut self.output))
    }
}
