//! Implementation of the `girder update` command.

use anyhow::Result;
use std::time::Instant;

use girder_lib::action::UPDATE;

use crate::output;

/// Bring the requested targets (or everything the local buildfile
/// declares) up to date.
pub fn cmd_update(args: &[String]) -> Result<()> {
  let start = Instant::now();
  let inv = super::setup(args)?;
  let result = super::perform(&inv, UPDATE)?;

  output::print_success(&format!(
    "updated {} target(s): {} changed, {} unchanged in {}",
    result.states.len(),
    result.changed(),
    result.unchanged(),
    output::format_duration(start.elapsed())
  ));
  Ok(())
}
