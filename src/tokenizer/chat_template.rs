/// Chat-template rendering: a pure function over a message list, orthogonal
/// to tokenization.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    ChatMl,
    Llama2,
    Llama3,
    Mistral,
    Phi,
    Auto,
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Render `messages` per `kind`. `Auto` inspects `arch_hint`/`chat_template_hint`
/// (the model's stored chat-template metadata, or its architecture string) to
/// pick a concrete kind, falling back to ChatML.
pub fn apply_template(
    kind: TemplateKind,
    messages: &[ChatMessage],
    arch_hint: Option<&str>,
    chat_template_hint: Option<&str>,
) -> String {
    let resolved = match kind {
        TemplateKind::Auto => resolve_auto(arch_hint, chat_template_hint),
        other => other,
    };

    match resolved {
        TemplateKind::ChatMl => render_chatml(messages),
        TemplateKind::Llama2 => render_llama2(messages),
        TemplateKind::Llama3 => render_llama3(messages),
        TemplateKind::Mistral => render_mistral(messages),
        TemplateKind::Phi => render_phi(messages),
        TemplateKind::Auto => render_chatml(messages),
    }
}

fn resolve_auto(arch_hint: Option<&str>, chat_template_hint: Option<&str>) -> TemplateKind {
    if let Some(hint) = chat_template_hint {
        let lower = hint.to_lowercase();
        if lower.contains("llama3") || lower.contains("<|start_header_id|>") {
            return TemplateKind::Llama3;
        }
        if lower.contains("[inst]") {
            return TemplateKind::Llama2;
        }
        if lower.contains("mistral") {
            return TemplateKind::Mistral;
        }
        if lower.contains("<|im_start|>") {
            return TemplateKind::ChatMl;
        }
    }
    if let Some(arch) = arch_hint {
        let lower = arch.to_lowercase();
        if lower.contains("llama3") {
            return TemplateKind::Llama3;
        }
        if lower.contains("llama") {
            return TemplateKind::Llama2;
        }
        if lower.contains("mistral") {
            return TemplateKind::Mistral;
        }
        if lower.contains("phi") {
            return TemplateKind::Phi;
        }
    }
    TemplateKind::ChatMl
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", m.role, m.content));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama2(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    let mut system = None;
    let mut rest = messages;
    if let Some(first) = messages.first() {
        if first.role == "system" {
            system = Some(first.content.clone());
            rest = &messages[1..];
        }
    }
    let mut turns = rest.chunks(2);
    let mut first_turn = true;
    for turn in &mut turns {
        let user = turn.first();
        let assistant = turn.get(1);
        let mut prompt = String::new();
        if first_turn {
            if let Some(sys) = &system {
                prompt.push_str(&format!("<<SYS>>\n{sys}\n<</SYS>>\n\n"));
            }
            first_turn = false;
        }
        if let Some(u) = user {
            prompt.push_str(&u.content);
        }
        out.push_str(&format!("<s>[INST] {prompt} [/INST]"));
        if let Some(a) = assistant {
            out.push_str(&format!(" {} </s>", a.content));
        }
    }
    out
}

fn render_llama3(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    out.push_str("<|begin_of_text|>");
    for m in messages {
        out.push_str(&format!(
            "<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>",
            m.role, m.content
        ));
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

fn render_mistral(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        match m.role.as_str() {
            "user" => out.push_str(&format!("[INST] {} [/INST]", m.content)),
            "assistant" => out.push_str(&format!("{}</s>", m.content)),
            _ => out.push_str(&m.content),
        }
    }
    out
}

fn render_phi(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for m in messages {
        out.push_str(&format!("<|{}|>\n{}<|end|>\n", m.role, m.content));
    }
    out.push_str("<|assistant|>\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: "user".to_string(),
            content: "hi".to_string(),
        }]
    }

    #[test]
    fn chatml_wraps_each_message() {
        let rendered = apply_template(TemplateKind::ChatMl, &messages(), None, None);
        assert!(rendered.contains("<|im_start|>user"));
        assert!(rendered.ends_with("<|im_start|>assistant\n"));
    }

    #[test]
    fn auto_picks_llama3_from_arch_hint() {
        let rendered = apply_template(TemplateKind::Auto, &messages(), Some("llama3"), None);
        assert!(rendered.contains("<|start_header_id|>user"));
    }

    #[test]
    fn auto_falls_back_to_chatml() {
        let rendered = apply_template(TemplateKind::Auto, &messages(), None, None);
        assert!(rendered.contains("<|im_start|>"));
    }
}
