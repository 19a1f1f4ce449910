//! Implementation of the `girder clean` command.

use anyhow::Result;
use std::time::Instant;

use girder_lib::action::CLEAN;

use crate::output;

/// Remove the requested targets, dependents before prerequisites.
pub fn cmd_clean(args: &[String]) -> Result<()> {
  let start = Instant::now();
  let inv = super::setup(args)?;
  let result = super::perform(&inv, CLEAN)?;

  output::print_success(&format!(
    "cleaned {} target(s): {} removed in {}",
    result.states.len(),
    result.changed(),
    output::format_duration(start.elapsed())
  ));
  Ok(())
}
