//! Data model for external command invocations.
//!
//! The shell template *grammar* (`<name[:type][?|*|+][=default]>` and
//! friends) is parsed by an external collaborator; the engine only consumes
//! the parsed form: a program name, a token stream, and path templates for
//! file outputs. Rendering substitutes resolved input values into the token
//! stream to produce an argv, and expands output path templates relative to
//! a per-unit working directory.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::value::Bindings;

/// One element of a parsed command template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TemplateToken {
    /// Verbatim argument.
    Literal(String),
    /// Substituted with the resolved value of an input field. Sequence
    /// values expand to one argument per element.
    Input { field: String },
    /// Substituted with the materialized path of an output field.
    Output { field: String },
}

/// A parsed command template.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    pub tokens: Vec<TemplateToken>,
    /// Path template per file output, rendered under the unit work dir.
    /// `{name}` placeholders are substituted with input values.
    pub output_paths: FxHashMap<String, String>,
    /// Output field that captures the command's stdout, if any.
    pub stdout_output: Option<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn arg(mut self, token: TemplateToken) -> Self {
        self.tokens.push(token);
        self
    }

    #[must_use]
    pub fn literal(self, arg: impl Into<String>) -> Self {
        self.arg(TemplateToken::Literal(arg.into()))
    }

    #[must_use]
    pub fn input(self, field: impl Into<String>) -> Self {
        self.arg(TemplateToken::Input {
            field: field.into(),
        })
    }

    #[must_use]
    pub fn output(self, field: impl Into<String>) -> Self {
        self.arg(TemplateToken::Output {
            field: field.into(),
        })
    }

    #[must_use]
    pub fn output_path(mut self, field: impl Into<String>, template: impl Into<String>) -> Self {
        self.output_paths.insert(field.into(), template.into());
        self
    }

    #[must_use]
    pub fn capture_stdout(mut self, field: impl Into<String>) -> Self {
        self.stdout_output = Some(field.into());
        self
    }

    /// Expands the output path templates under `work_dir`.
    pub fn resolve_output_paths(
        &self,
        inputs: &Bindings,
        work_dir: &Path,
    ) -> FxHashMap<String, String> {
        self.output_paths
            .iter()
            .map(|(field, template)| {
                let mut rendered = template.clone();
                for (name, value) in inputs {
                    rendered = rendered.replace(&format!("{{{name}}}"), &scalar_text(value));
                }
                let path = work_dir.join(rendered);
                (field.clone(), path.to_string_lossy().into_owned())
            })
            .collect()
    }

    /// Renders the argv from resolved inputs and materialized output paths.
    ///
    /// Inputs that were left unbound (optional fields without defaults) are
    /// skipped rather than rendered empty.
    pub fn render(&self, inputs: &Bindings, output_paths: &FxHashMap<String, String>) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.tokens.len());
        for token in &self.tokens {
            match token {
                TemplateToken::Literal(text) => argv.push(text.clone()),
                TemplateToken::Input { field } => match inputs.get(field) {
                    Some(Value::Array(items)) => {
                        argv.extend(items.iter().map(scalar_text));
                    }
                    Some(value) => argv.push(scalar_text(value)),
                    None => {}
                },
                TemplateToken::Output { field } => {
                    if let Some(path) = output_paths.get(field) {
                        argv.push(path.clone());
                    }
                }
            }
        }
        argv
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn render_substitutes_inputs_and_outputs() {
        let template = CommandTemplate::new("ffmpeg")
            .literal("-i")
            .input("in_video")
            .literal("-o")
            .output("out_video")
            .output_path("out_video", "out.mp4");

        let mut inputs = Bindings::default();
        inputs.insert("in_video".into(), json!("clip.mp4"));
        let outs = template.resolve_output_paths(&inputs, Path::new("/work/u0"));
        let argv = template.render(&inputs, &outs);
        assert_eq!(argv[..3], ["-i".to_string(), "clip.mp4".into(), "-o".into()]);
        assert!(argv[3].ends_with("out.mp4"));
    }

    #[test]
    fn sequence_inputs_fan_out_to_arguments() {
        let template = CommandTemplate::new("cat").input("files");
        let mut inputs = Bindings::default();
        inputs.insert("files".into(), json!(["a.txt", "b.txt"]));
        let argv = template.render(&inputs, &FxHashMap::default());
        assert_eq!(argv, vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn unbound_optional_inputs_are_skipped() {
        let template = CommandTemplate::new("tool").literal("-v").input("missing");
        let argv = template.render(&Bindings::default(), &FxHashMap::default());
        assert_eq!(argv, vec!["-v"]);
    }
}
