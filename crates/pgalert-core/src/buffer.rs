/// Alert texts waiting for the next dispatch point.
#[derive(Debug, Default)]
pub struct AlertBuffer {
    entries: Vec<String>,
}

impl AlertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, text: impl Into<String>) {
        self.entries.push(text.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains the buffer into one message body, one alert per line.
    pub fn take(&mut self) -> Option<String> {
        if self.entries.is_empty() {
            return None;
        }
        let body = self.entries.join("\n");
        self.entries.clear();
        Some(body)
    }
}
