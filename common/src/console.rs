/// Longest line kept; further bytes before the newline are dropped.
pub const MAX_LINE_LEN: usize = 256;

/// Collects console bytes into command lines. A line is complete at `\n` and
/// is handed over with its terminator; `\r` and other bytes stay in the
/// buffer for the parser to clean.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: Vec<u8>,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, byte: u8) -> Option<String> {
        if self.buffer.len() < MAX_LINE_LEN {
            self.buffer.push(byte);
        }
        if byte != b'\n' {
            return None;
        }

        if self.buffer.last() != Some(&b'\n') {
            self.buffer.push(b'\n');
        }
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        Some(line)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
