/// Constrained decoding: mask logits so only tokens that keep the generated
/// text a valid prefix of the target grammar retain nonzero probability.
///
/// These are structural validators (bracket/quote balance, paren depth, tag
/// stacks), not full grammars — they accept some strings a strict JSON/SQL/XML
/// parser would reject (e.g. JSON's `prefix_valid` doesn't enforce that object
/// keys are followed by exactly one value), but they never accept a text that
/// a strict parser would also reject as structurally broken (mismatched
/// brackets, unterminated strings). `mask` rescans the full candidate string
/// per vocabulary entry; fine for the struct's intended use (a handful of
/// constrained slots per generation, not a vocab-scanning grammar engine).
use regex::Regex;

use crate::tokenizer::{TokenId, Tokenizer};

#[derive(Debug, Clone)]
pub enum Constraint {
    Json,
    Sql,
    Xml,
    Regex { pattern: Regex, anchored: Regex },
    Enum(Vec<String>),
}

impl Constraint {
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        let anchored = Regex::new(&format!("^(?:{pattern})$"))?;
        let pattern = Regex::new(pattern)?;
        Ok(Constraint::Regex { pattern, anchored })
    }

    /// Set every logit whose token, appended to `generated_so_far`, would
    /// violate the grammar to `-inf`.
    pub fn mask(&self, generated_so_far: &str, tokenizer: &Tokenizer, logits: &mut [f32]) {
        for (id, logit) in logits.iter_mut().enumerate() {
            let Some(token_str) = tokenizer.token_str(id as TokenId) else {
                continue;
            };
            if token_str.is_empty() {
                continue;
            }
            let mut candidate = String::with_capacity(generated_so_far.len() + token_str.len());
            candidate.push_str(generated_so_far);
            candidate.push_str(token_str);
            if !self.prefix_valid(&candidate) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    pub fn is_complete(&self, text: &str) -> bool {
        match self {
            Constraint::Json => json_prefix_valid(text) && json_balanced(text),
            Constraint::Sql => sql_complete(text),
            Constraint::Xml => xml_prefix_valid(text) && xml_balanced(text),
            Constraint::Regex { anchored, .. } => anchored.is_match(text),
            Constraint::Enum(allowed) => allowed.iter().any(|a| a == text),
        }
    }

    fn prefix_valid(&self, text: &str) -> bool {
        match self {
            Constraint::Json => json_prefix_valid(text),
            Constraint::Sql => sql_prefix_valid(text),
            Constraint::Xml => xml_prefix_valid(text),
            Constraint::Regex { pattern, .. } => pattern.find(text).is_some_and(|m| m.start() == 0) || text.is_empty(),
            Constraint::Enum(allowed) => allowed.iter().any(|a| a.starts_with(text)),
        }
    }
}

/// Bracket/quote-balance scan: rejects a premature closer, an unterminated
/// escape, or content trailing a fully-closed top-level value.
fn json_prefix_valid(text: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut closed_top_level = false;

    for c in text.chars() {
        if closed_top_level && !c.is_whitespace() {
            return false;
        }
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => depth += 1,
            '}' | ']' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
                if depth == 0 {
                    closed_top_level = true;
                }
            }
            _ => {}
        }
    }
    depth >= 0
}

fn json_balanced(text: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut saw_value = false;
    for c in text.chars() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                saw_value = true;
            }
            '{' | '[' => {
                depth += 1;
                saw_value = true;
            }
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }
    saw_value && depth == 0 && !in_string
}

const SQL_KEYWORDS: [&str; 5] = ["SELECT", "INSERT", "UPDATE", "DELETE", "WITH"];

fn sql_prefix_valid(text: &str) -> bool {
    let trimmed = text.trim_start();
    if trimmed.is_empty() {
        return true;
    }
    let starts_ok = SQL_KEYWORDS
        .iter()
        .any(|kw| kw.len() >= trimmed.len().min(kw.len()) && kw.starts_with(&trimmed.to_uppercase()[..trimmed.len().min(kw.len())]));
    if !starts_ok && trimmed.split_whitespace().next().is_some() {
        // Once a full first word is present, it must match a keyword exactly.
        let first_word = trimmed.split_whitespace().next().unwrap();
        if first_word.len() >= SQL_KEYWORDS.iter().map(|k| k.len()).min().unwrap_or(0)
            && !SQL_KEYWORDS.iter().any(|kw| kw.eq_ignore_ascii_case(first_word))
        {
            return false;
        }
    }

    let mut depth: i32 = 0;
    let mut in_string = false;
    for c in trimmed.chars() {
        if in_string {
            if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => in_string = true,
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            ';' => {
                // statement terminator: anything after it must be whitespace
            }
            _ => {}
        }
    }
    true
}

fn sql_complete(text: &str) -> bool {
    let trimmed = text.trim_end();
    sql_prefix_valid(text) && trimmed.ends_with(';')
}

fn xml_prefix_valid(text: &str) -> bool {
    xml_tag_stack(text).is_some()
}

fn xml_balanced(text: &str) -> bool {
    xml_tag_stack(text).map(|stack| stack.is_empty()).unwrap_or(false)
}

/// Walk `<tag>`/`</tag>`/`<tag/>` occurrences, returning the open-tag stack,
/// or `None` if a closing tag doesn't match the innermost open tag.
fn xml_tag_stack(text: &str) -> Option<Vec<String>> {
    let mut stack = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('<') {
        let Some(close_rel) = rest[open..].find('>') else {
            // Unterminated tag at end of text: acceptable as an in-progress prefix.
            break;
        };
        let tag_inner = &rest[open + 1..open + close_rel];
        if let Some(name) = tag_inner.strip_prefix('/') {
            match stack.pop() {
                Some(top) if top == name.trim() => {}
                _ => return None,
            }
        } else if let Some(name) = tag_inner.strip_suffix('/') {
            let _ = name; // self-closing tag, nothing pushed
        } else {
            let name = tag_inner.split_whitespace().next().unwrap_or(tag_inner);
            stack.push(name.to_string());
        }
        rest = &rest[open + close_rel + 1..];
    }
    Some(stack)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_prefix_rejects_premature_close() {
        assert!(!json_prefix_valid("}"));
        assert!(json_prefix_valid("{\"a\": 1"));
        assert!(json_prefix_valid("{\"a\": 1}"));
    }

    #[test]
    fn json_complete_requires_balanced_braces() {
        let c = Constraint::Json;
        assert!(!c.is_complete("{\"a\": 1"));
        assert!(c.is_complete("{\"a\": 1}"));
    }

    #[test]
    fn sql_requires_known_starting_keyword() {
        assert!(sql_prefix_valid("SEL"));
        assert!(!sql_prefix_valid("DROP TABLE"));
        assert!(sql_complete("SELECT * FROM t;"));
    }

    #[test]
    fn xml_stack_rejects_mismatched_close() {
        assert!(xml_prefix_valid("<a><b></b>"));
        assert!(!xml_prefix_valid("<a></b>"));
        let c = Constraint::Xml;
        assert!(c.is_complete("<a><b></b></a>"));
    }

    #[test]
    fn enum_constraint_matches_exact_members() {
        let c = Constraint::Enum(vec!["yes".to_string(), "no".to_string()]);
        assert!(c.is_complete("yes"));
        assert!(!c.is_complete("maybe"));
    }

    #[test]
    fn regex_constraint_matches_full_pattern() {
        let c = Constraint::regex(r"[a-z]+\d+").unwrap();
        assert!(c.is_complete("abc123"));
        assert!(!c.is_complete("abc"));
    }
}
