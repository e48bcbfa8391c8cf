//! Prompt rendering for instruction-tuned GGUF models
//!
//! | name     | template                                       |
//! |----------|------------------------------------------------|
//! | `chatml` | `<\|im_start\|>role ... <\|im_end\|>` (Qwen2, DeepSeek-R1 distills) |
//! | `llama3` | `<\|start_header_id\|>role<\|end_header_id\|>` |
//! | `llama2` | `[INST] ... [/INST]`                           |
//! | `plain`  | `System:/User:/Assistant:` lines               |

use distillr_common::{DistillError, Result};
use distillr_proto::{ChatMessage, Role};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    ChatMl,
    Llama3,
    Llama2,
    Plain,
}

impl FromStr for ChatFormat {
    type Err = DistillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "chatml" | "qwen2" => Ok(ChatFormat::ChatMl),
            "llama3" => Ok(ChatFormat::Llama3),
            "llama2" | "llama" | "mistral" => Ok(ChatFormat::Llama2),
            "plain" => Ok(ChatFormat::Plain),
            other => Err(DistillError::config(format!("Unknown chat format: {}", other))),
        }
    }
}

impl ChatFormat {
    /// Guess the template from special tokens in the vocabulary, then the
    /// GGUF `general.architecture`
    pub fn detect(arch: &str, has_token: impl Fn(&str) -> bool) -> Self {
        if has_token("<|im_start|>") {
            return ChatFormat::ChatMl;
        }
        if has_token("<|eot_id|>") {
            return ChatFormat::Llama3;
        }
        match arch {
            "qwen2" => ChatFormat::ChatMl,
            "llama" | "mistral" => ChatFormat::Llama2,
            _ => ChatFormat::Plain,
        }
    }

    /// End-of-turn markers; generation stops on any of these tokens
    pub fn stop_tokens(self) -> &'static [&'static str] {
        match self {
            ChatFormat::ChatMl => &["<|im_end|>", "<|im_start|>", "<|endoftext|>"],
            ChatFormat::Llama3 => &["<|eot_id|>", "<|end_of_text|>", "<|start_header_id|>"],
            ChatFormat::Llama2 => &["</s>", "[INST]"],
            ChatFormat::Plain => &["</s>", "<|endoftext|>"],
        }
    }

    /// Render a conversation, ending with the assistant's opening tag
    pub fn render(self, messages: &[ChatMessage]) -> String {
        match self {
            ChatFormat::ChatMl => render_chatml(messages),
            ChatFormat::Llama3 => render_llama3(messages),
            ChatFormat::Llama2 => render_llama2(messages),
            ChatFormat::Plain => render_plain(messages),
        }
    }
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut s = String::new();
    for message in messages {
        s.push_str(&format!(
            "<|im_start|>{}\n{}<|im_end|>\n",
            message.role, message.content
        ));
    }
    s.push_str("<|im_start|>assistant\n");
    s
}

fn render_llama3(messages: &[ChatMessage]) -> String {
    let mut s = String::from("<|begin_of_text|>");
    for message in messages {
        s.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            message.role, message.content
        ));
    }
    s.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    s
}

/// The system prompt is folded into the first `[INST]` block.
fn render_llama2(messages: &[ChatMessage]) -> String {
    let mut s = String::new();
    let mut system: Option<&str> = None;

    for message in messages {
        match message.role {
            Role::System => system = Some(message.content.as_str()),
            Role::User => {
                let content = match system.take() {
                    Some(sys) => format!("<<SYS>>\n{}\n<</SYS>>\n\n{}", sys, message.content),
                    None => message.content.clone(),
                };
                s.push_str(&format!("<s>[INST] {} [/INST]", content));
            }
            Role::Assistant => s.push_str(&format!(" {} </s>", message.content)),
        }
    }
    s
}

fn render_plain(messages: &[ChatMessage]) -> String {
    let mut s = String::new();
    for message in messages {
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        };
        s.push_str(&format!("{}: {}\n\n", label, message.content));
    }
    s.push_str("Assistant:");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("hello"),
        ]
    }

    #[test]
    fn test_chatml() {
        let out = ChatFormat::ChatMl.render(&conversation());
        assert!(out.starts_with("<|im_start|>system\nBe brief.<|im_end|>\n"));
        assert!(out.contains("<|im_start|>user\nhello<|im_end|>"));
        assert!(out.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn test_llama3() {
        let out = ChatFormat::Llama3.render(&conversation());
        assert!(out.starts_with("<|begin_of_text|>"));
        assert!(out.contains("<|start_header_id|>user<|end_header_id|>\n\nhello<|eot_id|>"));
        assert!(out.ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_llama2_folds_system_prompt() {
        let out = ChatFormat::Llama2.render(&conversation());
        assert_eq!(out, "<s>[INST] <<SYS>>\nBe brief.\n<</SYS>>\n\nhello [/INST]");

        let out = ChatFormat::Llama2.render(&[ChatMessage::user("hi")]);
        assert_eq!(out, "<s>[INST] hi [/INST]");
    }

    #[test]
    fn test_plain() {
        let out = ChatFormat::Plain.render(&[ChatMessage::user("hi")]);
        assert_eq!(out, "User: hi\n\nAssistant:");
    }

    #[test]
    fn test_parse_and_detect() {
        assert_eq!("ChatML".parse::<ChatFormat>().unwrap(), ChatFormat::ChatMl);
        assert_eq!("llama".parse::<ChatFormat>().unwrap(), ChatFormat::Llama2);
        assert!("vicuna".parse::<ChatFormat>().is_err());

        assert_eq!(
            ChatFormat::detect("llama", |t| t == "<|im_start|>"),
            ChatFormat::ChatMl
        );
        assert_eq!(
            ChatFormat::detect("llama", |t| t == "<|eot_id|>"),
            ChatFormat::Llama3
        );
        assert_eq!(ChatFormat::detect("qwen2", |_| false), ChatFormat::ChatMl);
        assert_eq!(ChatFormat::detect("phi3", |_| false), ChatFormat::Plain);
    }
}
