use std::collections::BTreeMap;

use minijinja::Environment;

use rill_core::Value;

use crate::BackendError;

/// Render a command template against resolved inputs.
///
/// Inputs substitute as their command-string forms: files as their localized
/// paths, arrays space-joined.
pub(crate) fn render_command(
  template: &str,
  inputs: &BTreeMap<String, Value>,
) -> Result<String, BackendError> {
  let context: BTreeMap<&str, String> = inputs
    .iter()
    .map(|(name, value)| (name.as_str(), value.to_command_string()))
    .collect();

  let env = Environment::new();
  env
    .render_str(template, context)
    .map_err(|e| BackendError::Template {
      message: e.to_string(),
    })
}
