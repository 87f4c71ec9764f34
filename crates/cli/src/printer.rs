//! Subscriber that prints events as they arrive

use owo_colors::OwoColorize;
use parking_lot::Mutex;
use std::io::Write;
use watcher::{Event, EventKind, EventSubscriber};

/// Writes one line per event to the wrapped writer
pub struct EventPrinter<W: Write + Send> {
    out: Mutex<W>,
    color: bool,
    show_unknown: bool,
}

impl<W: Write + Send> EventPrinter<W> {
    pub fn new(out: W, color: bool, show_unknown: bool) -> Self {
        Self {
            out: Mutex::new(out),
            color,
            show_unknown,
        }
    }

    fn render(&self, event: &Event) -> String {
        let line = event.to_string();
        if !self.color {
            return line;
        }
        match event.kind() {
            EventKind::Created => line.green().to_string(),
            EventKind::Deleted => line.red().to_string(),
            EventKind::Modified => line.yellow().to_string(),
            EventKind::Unknown => line.dimmed().to_string(),
        }
    }

    #[cfg(test)]
    fn into_inner(self) -> W {
        self.out.into_inner()
    }
}

impl<W: Write + Send> EventSubscriber for EventPrinter<W> {
    fn add_events(&self, events: &[Event]) -> anyhow::Result<()> {
        let mut out = self.out.lock();
        for event in events {
            if event.kind() == EventKind::Unknown && !self.show_unknown {
                continue;
            }
            writeln!(out, "{}", self.render(event))?;
        }
        out.flush()?;
        Ok(())
    }
}
