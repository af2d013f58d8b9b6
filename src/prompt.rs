//! Chat prompt formatting
//!
//! A custom template set at load time wins, then the template embedded in the
//! model, then a fixed ChatML layout. Template output length is unbounded, so
//! every application probes the required size and re-applies once with an
//! exactly-sized buffer when the first buffer was too small.

use crate::runtime::{ChatMessage, Model};
use tracing::{debug, warn};

/// First-pass buffer for template application
const INITIAL_TEMPLATE_BUFFER: usize = 2048;

/// Which tier produced the formatted prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptSource {
    Custom,
    Native,
    Fallback,
}

/// Fixed ChatML markup used when no template could be applied
pub fn fallback_prompt(system: &str, user: &str) -> String {
    format!(
        "<|im_start|>system\n{system}<|im_end|>\n<|im_start|>user\n{user}<|im_end|>\n<|im_start|>assistant\n"
    )
}

/// Formats a (system, user) exchange for one model
pub struct PromptFormatter<'a> {
    model: &'a dyn Model,
    custom_template: Option<&'a str>,
}

impl<'a> PromptFormatter<'a> {
    pub fn new(model: &'a dyn Model, custom_template: Option<&'a str>) -> Self {
        Self {
            model,
            custom_template: custom_template.filter(|t| !t.trim().is_empty()),
        }
    }

    pub fn format(&self, system: &str, user: &str) -> String {
        self.format_with_source(system, user).0
    }

    pub fn format_with_source(&self, system: &str, user: &str) -> (String, PromptSource) {
        let messages = [ChatMessage::system(system), ChatMessage::user(user)];
        let initial = INITIAL_TEMPLATE_BUFFER;

        if let Some(template) = self.custom_template {
            match self.apply(template, &messages, initial) {
                Some(prompt) => return (prompt, PromptSource::Custom),
                None => warn!("Custom chat template could not be applied"),
            }
        }

        if let Some(native) = self.model.chat_template() {
            match self.apply(&native, &messages, initial) {
                Some(prompt) => return (prompt, PromptSource::Native),
                None => debug!("Model chat template could not be applied"),
            }
        }

        debug!("Using fallback ChatML prompt");
        (fallback_prompt(system, user), PromptSource::Fallback)
    }

    /// Apply `template`, resizing once to the reported length. `None` when unusable.
    fn apply(&self, template: &str, messages: &[ChatMessage], initial: usize) -> Option<String> {
        let mut buf = vec![0u8; initial];
        let n = self
            .model
            .apply_chat_template(template, messages, true, &mut buf);
        if n <= 0 {
            return None;
        }

        let required = n as usize;
        if required > buf.len() {
            debug!(required, initial, "Template buffer too small, re-applying");
            buf.resize(required, 0);
            let n = self
                .model
                .apply_chat_template(template, messages, true, &mut buf);
            if n <= 0 || n as usize > buf.len() {
                return None;
            }
            buf.truncate(n as usize);
        } else {
            buf.truncate(required);
        }

        String::from_utf8(buf).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::MockRuntime;
    use crate::runtime::{ModelLoader, ModelParams};
    use std::path::Path;

    fn model(runtime: &MockRuntime) -> Box<dyn Model> {
        runtime
            .load_model(Path::new("m.gguf"), &ModelParams::default())
            .unwrap()
    }

    #[test]
    fn test_custom_template_wins() {
        let runtime = MockRuntime::new().native_template(Some("chatml"));
        let model = model(&runtime);
        let (prompt, source) =
            PromptFormatter::new(model.as_ref(), Some("llama3")).format_with_source("s", "u");
        assert_eq!(source, PromptSource::Custom);
        assert!(prompt.starts_with("<|start_header_id|>system"));
    }

    #[test]
    fn test_unusable_custom_falls_to_native() {
        let runtime = MockRuntime::new().native_template(Some("gemma"));
        let model = model(&runtime);
        let (_, source) =
            PromptFormatter::new(model.as_ref(), Some("not a template")).format_with_source("s", "u");
        assert_eq!(source, PromptSource::Native);
    }

    #[test]
    fn test_no_template_uses_fallback_verbatim() {
        let runtime = MockRuntime::new().native_template(None);
        let model = model(&runtime);
        let prompt = PromptFormatter::new(model.as_ref(), Some("???")).format("sys {x}", "user\n");
        assert_eq!(
            prompt,
            "<|im_start|>system\nsys {x}<|im_end|>\n<|im_start|>user\nuser\n<|im_end|>\n<|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_blank_custom_template_ignored() {
        let runtime = MockRuntime::new();
        let model = model(&runtime);
        PromptFormatter::new(model.as_ref(), Some("  ")).format("s", "u");
        assert_eq!(runtime.template_calls()[0].0, "chatml");
    }

    #[test]
    fn test_short_prompt_applies_once() {
        let runtime = MockRuntime::new();
        let model = model(&runtime);
        PromptFormatter::new(model.as_ref(), None).format("s", "u");
        assert_eq!(runtime.template_calls(), vec![("chatml".to_string(), INITIAL_TEMPLATE_BUFFER)]);
    }

    #[test]
    fn test_long_prompt_resizes_exactly_once() {
        let runtime = MockRuntime::new();
        let model = model(&runtime);
        let user = "x".repeat(3 * INITIAL_TEMPLATE_BUFFER);
        let expected = fallback_prompt("sys", &user);

        let prompt = PromptFormatter::new(model.as_ref(), None).format("sys", &user);
        assert_eq!(prompt, expected);

        let calls = runtime.template_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].1, INITIAL_TEMPLATE_BUFFER);
        assert_eq!(calls[1].1, expected.len());
    }
}
