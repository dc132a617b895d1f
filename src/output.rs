use std::cell::Cell;
use std::io::{self, Write};

use crossterm::QueueableCommand;
use crossterm::cursor::MoveToColumn;
use crossterm::style::Print;
use crossterm::terminal::{Clear, ClearType};
use serde::Serialize;

use crate::domain::JobStatus;
use crate::progress::{ProgressEvent, ProgressSink};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Status line on stderr. Repeated `running` reports overwrite each other;
/// everything else gets its own line.
#[derive(Default)]
pub struct TerminalProgress {
    inline: Cell<bool>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(&self, message: &str, keep_inline: bool) -> io::Result<()> {
        let mut stderr = io::stderr();
        stderr
            .queue(MoveToColumn(0))?
            .queue(Clear(ClearType::CurrentLine))?
            .queue(Print(message))?;
        if !keep_inline {
            stderr.queue(Print("\n"))?;
        }
        stderr.flush()?;
        self.inline.set(keep_inline);
        Ok(())
    }
}

impl ProgressSink for TerminalProgress {
    fn event(&self, event: ProgressEvent) {
        let keep_inline = matches!(
            event,
            ProgressEvent::Status {
                status: JobStatus::Running,
                ..
            }
        );
        if let Err(err) = self.render(&event.message(), keep_inline) {
            tracing::debug!(error = %err, "progress output failed");
        }
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        if self.inline.get() {
            eprintln!();
        }
    }
}
