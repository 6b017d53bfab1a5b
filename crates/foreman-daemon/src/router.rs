//! Task-to-worker routing.
//!
//! Picks the profile best suited to an ad hoc task. Rules, first match wins:
//!
//! 1. an image attachment goes to the first vision-capable profile;
//! 2. the profile with the highest keyword score against the task text;
//! 3. a profile called `coder`;
//! 4. the first profile in catalog order.
//!
//! An empty catalog yields `None`.

use std::sync::LazyLock;

use regex::Regex;

use foreman_core::WorkerProfile;

use crate::backend::Attachment;

#[allow(clippy::expect_used)]
static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-z0-9][a-z0-9_\-]*").expect("static regex is valid"));

#[allow(clippy::expect_used)]
static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://\S+").expect("static regex is valid"));

const EXACT_ID_SCORE: u32 = 5;
const EXACT_TAG_SCORE: u32 = 3;
const WEB_URL_SCORE: u32 = 2;
const TEXT_MATCH_SCORE: u32 = 1;
/// Shorter words are too common to count as free-text matches.
const MIN_TEXT_TOKEN_LEN: usize = 4;

const FALLBACK_PROFILE: &str = "coder";

/// Choose a profile id for `task`, or `None` when there are no profiles.
pub fn select_worker_id(
    task: &str,
    profiles: &[WorkerProfile],
    attachments: &[Attachment],
) -> Option<String> {
    if attachments.iter().any(Attachment::is_image)
        && let Some(profile) = profiles.iter().find(|p| p.vision())
    {
        return Some(profile.id.clone());
    }

    let lowered = task.to_lowercase();
    let tokens: Vec<&str> = WORD_RE.find_iter(&lowered).map(|m| m.as_str()).collect();
    let has_url = URL_RE.is_match(task);

    let mut best: Option<(&WorkerProfile, u32)> = None;
    for profile in profiles {
        let score = score_profile(profile, &tokens, has_url);
        // strict comparison keeps the earliest profile on ties
        if score > 0 && best.is_none_or(|(_, top)| score > top) {
            best = Some((profile, score));
        }
    }
    if let Some((profile, _)) = best {
        return Some(profile.id.clone());
    }

    profiles
        .iter()
        .find(|p| p.id == FALLBACK_PROFILE || p.name.eq_ignore_ascii_case(FALLBACK_PROFILE))
        .or_else(|| profiles.first())
        .map(|p| p.id.clone())
}

fn score_profile(profile: &WorkerProfile, tokens: &[&str], has_url: bool) -> u32 {
    let id = profile.id.to_lowercase();
    let tags: Vec<String> = profile.tags.iter().map(|t| t.to_lowercase()).collect();
    let text = format!("{} {}", profile.name, profile.description).to_lowercase();

    let mut score = 0;
    for token in tokens {
        if *token == id {
            score += EXACT_ID_SCORE;
        } else if tags.iter().any(|t| t == token) {
            score += EXACT_TAG_SCORE;
        } else if token.len() >= MIN_TEXT_TOKEN_LEN && text.contains(token) {
            score += TEXT_MATCH_SCORE;
        }
    }
    if has_url && profile.web() {
        score += WEB_URL_SCORE;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<WorkerProfile> {
        vec![
            WorkerProfile {
                name: "Coder".to_string(),
                description: "Writes and edits code".to_string(),
                tags: vec!["code".to_string(), "refactor".to_string()],
                ..WorkerProfile::new("coder")
            },
            WorkerProfile {
                name: "Vision".to_string(),
                description: "Reads screenshots and diagrams".to_string(),
                supports_vision: Some(true),
                ..WorkerProfile::new("vision")
            },
            WorkerProfile {
                name: "Researcher".to_string(),
                description: "Searches documentation and the web".to_string(),
                supports_web: Some(true),
                tags: vec!["research".to_string()],
                ..WorkerProfile::new("web")
            },
        ]
    }

    #[test]
    fn image_attachment_routes_to_vision() {
        let picked = select_worker_id(
            "analyze this screenshot",
            &catalog(),
            &[Attachment::image("data:image/png;base64,AAAA")],
        );
        assert_eq!(picked.as_deref(), Some("vision"));
    }

    #[test]
    fn image_without_vision_profile_falls_through() {
        let profiles: Vec<_> = catalog().into_iter().filter(|p| !p.vision()).collect();
        let picked = select_worker_id("look", &profiles, &[Attachment::image("x")]);
        assert_eq!(picked.as_deref(), Some("coder"));
    }

    #[test]
    fn exact_id_beats_free_text() {
        // "documentation" hits web's description; "vision" is an exact id
        let picked = select_worker_id("ask vision about the documentation", &catalog(), &[]);
        assert_eq!(picked.as_deref(), Some("vision"));
    }

    #[test]
    fn tag_match_routes() {
        let picked = select_worker_id("please do some research on tokio", &catalog(), &[]);
        assert_eq!(picked.as_deref(), Some("web"));
    }

    #[test]
    fn url_prefers_web_profile() {
        let picked = select_worker_id("summarise https://example.com/post", &catalog(), &[]);
        assert_eq!(picked.as_deref(), Some("web"));
    }

    #[test]
    fn no_match_falls_back_to_coder_then_first() {
        assert_eq!(
            select_worker_id("hello", &catalog(), &[]).as_deref(),
            Some("coder")
        );

        let without_coder: Vec<_> = catalog().into_iter().skip(1).collect();
        assert_eq!(
            select_worker_id("hello", &without_coder, &[]).as_deref(),
            Some("vision")
        );
    }

    #[test]
    fn empty_catalog_yields_none() {
        assert_eq!(select_worker_id("anything", &[], &[]), None);
    }
}
