//! Implementation of the `girder info` command.

use anyhow::{anyhow, Result};

use girder_lib::load;
use girder_lib::Engine;

use crate::output;

/// Show the project around the current directory.
pub fn cmd_info() -> Result<()> {
  let cwd = std::env::current_dir()?;
  let src_root = load::discover_src_root(&cwd)
    .ok_or_else(|| anyhow!("no project found in {} or above", cwd.display()))?;

  let mut eng = Engine::new();
  eng.work = cwd.clone();
  let root = load::load_project(&mut eng, &src_root, Some(&src_root), &cwd)?;

  let (out, src) = super::project_display(&eng, root);

  println!("Project");
  output::print_stat("out root", &out);
  output::print_stat("src root", &src);

  if let Some(var) = eng.vars.find("project") {
    if let Some(v) = eng.scopes.get(root).vars.get(var) {
      if let girder_lib::variable::Value::ProjectName(p) = v {
        output::print_stat("project", p.as_str());
      }
    }
  }

  let s = eng.scopes.get(root);
  let ops: Vec<&str> = (1..=s.operations.len() as u8)
    .filter_map(|id| s.operations.get(id).map(|o| o.name))
    .collect();
  output::print_stat("operations", &ops.join(", "));

  Ok(())
}
