//! Question Detector & Store (§4.5): classifies agent stdout lines
//! against fixed-order pattern rules and materializes `Question`
//! records.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{QuestionId, QuestionType};
use crate::paths::WorkspacePaths;

static CONFIRMATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(proceed|continue|confirm|yes/no|y/n)\??$").unwrap()
});

static PERMISSION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(allow|permission|authorize|grant access|approve|access)\s*\??$").unwrap()
});

static CHOICE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(select|choose|which|option)\b.*[\[(]([^\])]+)[\])]").unwrap()
});

static INPUT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?$").unwrap());

static QUESTION_COUNTER: Lazy<AtomicU64> = Lazy::new(|| AtomicU64::new(0));

/// Time-prefixed + monotonic counter, so ids sort chronologically even
/// within the same millisecond (§4.5).
pub fn new_question_id() -> QuestionId {
    let n = QUESTION_COUNTER.fetch_add(1, Ordering::SeqCst);
    QuestionId::new(format!("{}-{:06}", chrono::Utc::now().format("%Y%m%d%H%M%S%3f"), n))
}

#[derive(Debug, Clone)]
pub struct Detected {
    pub question_type: QuestionType,
    pub prompt: String,
    pub options: Vec<String>,
}

/// Classify a single already-trimmed, non-empty stdout line. Regex
/// checks run in fixed order — first match wins — so a line like
/// `"proceed?"` is a Confirmation even though it also ends in `?`
/// (§8 "Question line ending with `??`... Confirmation wins over
/// Input").
pub fn classify(line: &str) -> Option<Detected> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    if CONFIRMATION_RE.is_match(trimmed) {
        return Some(Detected {
            question_type: QuestionType::Confirmation,
            prompt: trimmed.to_string(),
            options: Vec::new(),
        });
    }

    if PERMISSION_RE.is_match(trimmed) {
        return Some(Detected {
            question_type: QuestionType::Permission,
            prompt: trimmed.to_string(),
            options: Vec::new(),
        });
    }

    if let Some(caps) = CHOICE_RE.captures(trimmed) {
        let options = caps
            .get(2)
            .map(|m| {
                m.as_str()
                    .split(['/', ',', '|'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        return Some(Detected {
            question_type: QuestionType::Choice,
            prompt: trimmed.to_string(),
            options,
        });
    }

    if INPUT_RE.is_match(trimmed) {
        return Some(Detected {
            question_type: QuestionType::Input,
            prompt: trimmed.to_string(),
            options: Vec::new(),
        });
    }

    None
}

/// Write the external-contract per-question file
/// `{covenDir}/questions/{id}.json` (§6). The State Store independently
/// keeps its own in-memory/`state.json` copy for API convenience; this
/// file is the durable, individually addressable record the contract
/// promises.
pub async fn persist_question_file(
    paths: &WorkspacePaths,
    question: &crate::domain::Question,
) -> Result<()> {
    tokio::fs::create_dir_all(paths.questions_dir())
        .await
        .context("creating questions directory")?;
    let path = paths.question_file(question.id.as_str());
    let content = serde_json::to_string_pretty(question).context("serializing question")?;
    tokio::fs::write(&path, content)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

pub async fn remove_question_file(paths: &WorkspacePaths, id: &QuestionId) -> Result<()> {
    let path = paths.question_file(id.as_str());
    match tokio::fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_confirmation_questions() {
        let d = classify("Do you want to proceed? (y/n)").unwrap();
        assert_eq!(d.question_type, QuestionType::Confirmation);
    }

    #[test]
    fn classifies_permission_questions() {
        let d = classify("Allow network access?").unwrap();
        assert_eq!(d.question_type, QuestionType::Permission);
    }

    #[test]
    fn classifies_choice_questions_and_extracts_options() {
        let d = classify("Which environment do you want? (staging/production)").unwrap();
        assert_eq!(d.question_type, QuestionType::Choice);
        assert_eq!(d.options, vec!["staging", "production"]);
    }

    #[test]
    fn classifies_plain_input_questions() {
        let d = classify("What is the target file name?").unwrap();
        assert_eq!(d.question_type, QuestionType::Input);
    }

    #[test]
    fn double_question_mark_confirmation_wins_over_input() {
        let d = classify("Ready to continue??").unwrap();
        assert_eq!(d.question_type, QuestionType::Confirmation);
    }

    #[test]
    fn non_question_lines_are_not_classified() {
        assert!(classify("Installing dependencies...").is_none());
        assert!(classify("").is_none());
    }

    #[test]
    fn ids_are_unique_and_monotonic_in_insertion_order() {
        let a = new_question_id();
        let b = new_question_id();
        assert_ne!(a, b);
    }
}
