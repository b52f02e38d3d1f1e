//! Interactive confirmation for destructive commands.

use std::io::{self, BufRead, IsTerminal, Write};

use anyhow::{Result, bail};

/// Ask a yes/no question on stderr. `force` answers yes without asking.
///
/// Refuses to guess when there is no terminal to ask on.
pub fn confirm(question: &str, force: bool) -> Result<bool> {
  if force {
    return Ok(true);
  }
  if !(io::stdin().is_terminal() && io::stderr().is_terminal()) {
    bail!("Refusing to continue without confirmation: stdin is not a terminal. Pass --force to skip the prompt.");
  }

  let mut stderr = io::stderr().lock();
  write!(stderr, "{question} [y/N] ")?;
  stderr.flush()?;

  let mut answer = String::new();
  io::stdin().lock().read_line(&mut answer)?;
  Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
  let answer = answer.trim();
  answer.eq_ignore_ascii_case("y") || answer.eq_ignore_ascii_case("yes")
}
