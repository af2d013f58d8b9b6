//! Built-in chat template families
//!
//! Runtimes without a Jinja engine recognise a template either by family name
//! (`chatml`, `llama3`, ...) or by the turn markers found in its source, and
//! render it with a fixed layout.

use super::ChatMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateFamily {
    ChatMl,
    Llama3,
    Gemma,
    Phi3,
    Zephyr,
}

impl TemplateFamily {
    /// Recognise `template` by name or by markers. `None` for anything else.
    pub fn detect(template: &str) -> Option<Self> {
        let name = template.trim().to_lowercase();
        match name.as_str() {
            "chatml" => return Some(Self::ChatMl),
            "llama3" => return Some(Self::Llama3),
            "gemma" => return Some(Self::Gemma),
            "phi3" => return Some(Self::Phi3),
            "zephyr" => return Some(Self::Zephyr),
            _ => {}
        }

        if template.contains("<|im_start|>") {
            Some(Self::ChatMl)
        } else if template.contains("<|start_header_id|>") {
            Some(Self::Llama3)
        } else if template.contains("<start_of_turn>") {
            Some(Self::Gemma)
        } else if template.contains("<|end|>") && template.contains("<|assistant|>") {
            Some(Self::Phi3)
        } else if template.contains("<|user|>") {
            Some(Self::Zephyr)
        } else {
            None
        }
    }

    pub fn render(&self, messages: &[ChatMessage], add_assistant: bool) -> String {
        let mut out = String::new();
        match self {
            Self::ChatMl => {
                for m in messages {
                    out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
                }
                if add_assistant {
                    out.push_str("<|im_start|>assistant\n");
                }
            }
            Self::Llama3 => {
                for m in messages {
                    out.push_str(&format!(
                        "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
                        m.role,
                        m.content.trim()
                    ));
                }
                if add_assistant {
                    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
                }
            }
            Self::Gemma => {
                // No system role: its content is prepended to the next user turn
                let mut pending_system = String::new();
                for m in messages {
                    match m.role.as_str() {
                        "system" => {
                            pending_system.push_str(m.content.trim());
                            pending_system.push_str("\n\n");
                        }
                        role => {
                            let role = if role == "assistant" { "model" } else { role };
                            out.push_str(&format!(
                                "<start_of_turn>{}\n{}{}<end_of_turn>\n",
                                role,
                                std::mem::take(&mut pending_system),
                                m.content.trim()
                            ));
                        }
                    }
                }
                if add_assistant {
                    out.push_str("<start_of_turn>model\n");
                }
            }
            Self::Phi3 => {
                for m in messages {
                    out.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role, m.content));
                }
                if add_assistant {
                    out.push_str("<|assistant|>\n");
                }
            }
            Self::Zephyr => {
                for m in messages {
                    out.push_str(&format!("<|{}|>\n{}</s>\n", m.role, m.content));
                }
                if add_assistant {
                    out.push_str("<|assistant|>\n");
                }
            }
        }
        out
    }
}

/// Copy as much of `rendered` as fits into `buf` and return its full byte length
pub fn write_rendered(rendered: &str, buf: &mut [u8]) -> i32 {
    let bytes = rendered.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
    i32::try_from(bytes.len()).unwrap_or(i32::MAX)
}

/// Render `messages` with `template` into `buf`, `-1` when the template is not recognised
pub fn apply_builtin(
    template: &str,
    messages: &[ChatMessage],
    add_assistant: bool,
    buf: &mut [u8],
) -> i32 {
    match TemplateFamily::detect(template) {
        Some(family) => write_rendered(&family.render(messages, add_assistant), buf),
        None => -1,
    }
}
