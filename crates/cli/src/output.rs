//! CLI output formatting utilities.
//!
//! Colored status lines, stage key and duration formatting, and JSON output.

use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ADD: &str = "+";
}

/// First 12 characters of a stage key, enough to tell stages apart in listings.
pub fn truncate_hash(hash: &str) -> &str {
  hash.get(..12).unwrap_or(hash)
}

/// Human-readable duration, rounded to milliseconds below a minute and to
/// seconds above.
pub fn format_duration(duration: Duration) -> String {
  let rounded = if duration.as_secs() >= 60 {
    Duration::from_secs(duration.as_secs())
  } else {
    Duration::from_millis(duration.as_millis() as u64)
  };
  humantime::format_duration(rounded).to_string()
}

/// Which stream a status line goes to and how its symbol is tinted.
#[derive(Clone, Copy)]
enum Status {
  Success,
  Error,
  Warning,
  Info,
}

impl Status {
  fn symbol(self) -> &'static str {
    match self {
      Status::Success => symbols::SUCCESS,
      Status::Error => symbols::ERROR,
      Status::Warning => symbols::WARNING,
      Status::Info => symbols::INFO,
    }
  }

  /// Problems go to stderr and are tinted in full; progress stays on stdout.
  fn stream(self) -> Stream {
    match self {
      Status::Error | Status::Warning => Stream::Stderr,
      Status::Success | Status::Info => Stream::Stdout,
    }
  }

  fn paint(self, text: &str) -> String {
    let stream = self.stream();
    match self {
      Status::Success => text.if_supports_color(stream, |s| s.green()).to_string(),
      Status::Error => text.if_supports_color(stream, |s| s.red()).to_string(),
      Status::Warning => text.if_supports_color(stream, |s| s.yellow()).to_string(),
      Status::Info => text.if_supports_color(stream, |s| s.blue()).to_string(),
    }
  }
}

fn status_line(status: Status, message: &str) {
  let symbol = status.paint(status.symbol());
  match status.stream() {
    Stream::Stderr => eprintln!("{symbol} {}", status.paint(message)),
    _ => println!("{symbol} {message}"),
  }
}

pub fn print_success(message: &str) {
  status_line(Status::Success, message);
}

pub fn print_error(message: &str) {
  status_line(Status::Error, message);
}

pub fn print_warning(message: &str) {
  status_line(Status::Warning, message);
}

pub fn print_info(message: &str) {
  status_line(Status::Info, message);
}

/// Indented `label: value` line under a status line.
pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {value}", label.if_supports_color(Stream::Stdout, |s| s.dimmed()));
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?;
  println!("{json}");
  Ok(())
}
