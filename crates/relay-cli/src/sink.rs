use async_trait::async_trait;
use relay_core::error::SendError;
use relay_core::event::Event;
use relay_core::queue::EventSender;
use std::path::PathBuf;

/// Appends each batch to a file as JSON lines, one event per line.
///
/// Encoding failures reject the batch; write failures are retryable.
pub struct FileSender {
    path: PathBuf,
}

impl FileSender {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl EventSender for FileSender {
    async fn send(&self, batch: &[Event]) -> Result<(), SendError> {
        let mut text = String::new();
        for event in batch {
            let line =
                serde_json::to_string(event).map_err(|e| SendError::Rejected(e.to_string()))?;
            text.push_str(&line);
            text.push('\n');
        }
        relay_core::io::append_text(&self.path, &text)
            .map_err(|e| SendError::Retryable(format!("{}: {e}", self.path.display())))
    }
}
