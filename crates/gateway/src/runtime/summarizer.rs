//! Title and tag generation — a short, bounded LLM pass.
//!
//! Runs twice per investigation: a pre-pass from the prompt alone (title
//! only) and a post-pass informed by the completed root-cause summary
//! (title + tags). Both are best-effort; a deterministic fallback title is
//! derived from the prompt when the model is unavailable.

use std::sync::Arc;
use std::time::Duration;

use ps_domain::error::Result;
use ps_domain::tool::Message;
use ps_providers::{ChatRequest, LlmProvider};

use super::excerpt;

const TITLE_MAX_CHARS: usize = 60;
const TITLE_MAX_TOKENS: u32 = 80;
const TITLE_TEMPERATURE: f32 = 0.3;
const TITLE_DEADLINE: Duration = Duration::from_secs(10);

const TITLE_INSTRUCTIONS: &str = "You title Kubernetes investigation reports. Reply with \
one line: a specific, scannable title of at most 60 characters naming the resource and \
the issue (e.g. \"Pod CrashLoopBackOff in payment-service\"). No quotes, no emoji. \
Optionally add a second line `tags: a, b, c` with up to four short lowercase tags.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleCard {
    pub title: String,
    pub tags: Vec<String>,
}

/// Ask the summarizer model for a title (and tags, when `root_cause` is
/// available). Bounded in tokens and wall time.
pub async fn generate_title(
    provider: Arc<dyn LlmProvider>,
    model: Option<String>,
    user_prompt: &str,
    root_cause: Option<&str>,
) -> Result<TitleCard> {
    let mut ask = format!("Investigation request:\n{user_prompt}\n");
    if let Some(cause) = root_cause {
        ask.push_str(&format!("\nRoot cause analysis:\n{cause}\n"));
    }
    ask.push_str("\nGenerate the title now.");

    let req = ChatRequest {
        messages: vec![Message::system(TITLE_INSTRUCTIONS), Message::user(ask)],
        tools: Vec::new(),
        temperature: Some(TITLE_TEMPERATURE),
        max_tokens: Some(TITLE_MAX_TOKENS),
        model,
    };

    let response = tokio::time::timeout(TITLE_DEADLINE, provider.chat(&req))
        .await
        .map_err(|_| ps_domain::error::Error::Timeout("title generation".into()))??;

    Ok(parse_title_output(&response.content))
}

/// Deterministic title from the prompt, used when the model pass fails.
pub fn fallback_title(prompt: &str) -> String {
    let title = excerpt(prompt, TITLE_MAX_CHARS);
    if title.is_empty() {
        "Kubernetes Investigation".to_string()
    } else {
        title
    }
}

fn parse_title_output(raw: &str) -> TitleCard {
    let mut title = String::new();
    let mut tags = Vec::new();

    for line in raw.lines() {
        let line = line.trim().trim_matches('"').trim_matches('\'');
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.to_ascii_lowercase().strip_prefix("tags:") {
            tags = rest
                .split(',')
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .take(4)
                .collect();
            continue;
        }
        if title.is_empty() {
            title = truncate_title(line);
        }
    }

    TitleCard { title, tags }
}

fn truncate_title(line: &str) -> String {
    if line.chars().count() <= TITLE_MAX_CHARS {
        return line.to_string();
    }
    line.chars().take(TITLE_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_title_and_tags() {
        let card = parse_title_output(
            "Pod CrashLoopBackOff in payment-service\ntags: crashloop, oom, Payments",
        );
        assert_eq!(card.title, "Pod CrashLoopBackOff in payment-service");
        assert_eq!(card.tags, vec!["crashloop", "oom", "payments"]);
    }

    #[test]
    fn strips_quotes_and_caps_length() {
        let long = "x".repeat(100);
        let card = parse_title_output(&format!("\"{long}\""));
        assert_eq!(card.title.chars().count(), 60);

        let card = parse_title_output("'DNS failure in prod'");
        assert_eq!(card.title, "DNS failure in prod");
    }

    #[test]
    fn tags_capped_at_four() {
        let card = parse_title_output("t\ntags: a, b, c, d, e, f");
        assert_eq!(card.tags.len(), 4);
    }

    #[test]
    fn fallback_title_from_prompt() {
        assert_eq!(
            fallback_title("why is pod X crashlooping?"),
            "why is pod X crashlooping?"
        );
        assert_eq!(fallback_title("   "), "Kubernetes Investigation");
        assert!(fallback_title(&"word ".repeat(50)).len() <= 63);
    }
}
