//! Cheap routing decisions made before and after SQL generation.
//!
//! Greetings and help requests are answered without calling the model. After
//! generation, SQL that touches none of the caller's tables is treated as a
//! general question rather than a data query.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::access::policy::{AccessPolicy, Role};
use crate::query::templates::templates_for_role;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Greeting,
    Help,
    Data,
}

const GREETING_WORDS: &[&str] = &[
    "hi", "hello", "hey", "hiya", "howdy", "greetings", "yo", "sup", "hola", "namaste",
    "morning", "afternoon", "evening", "thanks", "thank", "thx", "ty", "bye", "goodbye", "ok",
    "okay", "cool",
];

const FILLER_WORDS: &[&str] = &[
    "there", "you", "good", "assistant", "bot", "all", "team", "so", "much", "very", "the", "a",
];

const HELP_PHRASES: &[&str] = &[
    "help",
    "what can you do",
    "what can i ask",
    "what should i ask",
    "how does this work",
    "how do i use",
    "how to use",
    "who are you",
    "what are you",
    "example questions",
    "examples",
];

/// Longer messages are treated as real questions even if they mention help.
const MAX_HELP_WORDS: usize = 6;
const MAX_GREETING_WORDS: usize = 4;

static SQL_WORD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_]*").expect("identifier pattern"));

pub fn classify(text: &str) -> Intent {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '\'' { c } else { ' ' })
        .collect();
    let words: Vec<&str> = normalized.split_whitespace().collect();

    if words.is_empty() {
        return Intent::Help;
    }

    if words.len() <= MAX_GREETING_WORDS
        && words.iter().any(|w| GREETING_WORDS.contains(w))
        && words
            .iter()
            .all(|w| GREETING_WORDS.contains(w) || FILLER_WORDS.contains(w))
    {
        return Intent::Greeting;
    }

    if words.len() <= MAX_HELP_WORDS {
        let joined = words.join(" ");
        if HELP_PHRASES.iter().any(|phrase| contains_phrase(&joined, phrase)) {
            return Intent::Help;
        }
    }

    Intent::Data
}

fn contains_phrase(text: &str, phrase: &str) -> bool {
    text == phrase
        || text.starts_with(&format!("{phrase} "))
        || text.ends_with(&format!(" {phrase}"))
        || text.contains(&format!(" {phrase} "))
}

/// Whether `sql` names at least one table the role may query.
pub fn references_permitted_table(sql: &str, role: Role) -> bool {
    let allowed = AccessPolicy::global().allowed_tables(role);
    SQL_WORD_RE
        .find_iter(sql)
        .any(|m| allowed.iter().any(|t| t.eq_ignore_ascii_case(m.as_str())))
}

/// Canned reply for a greeting or help request, pointing at the role's templates.
pub fn friendly_response(intent: Intent, role: Role) -> String {
    let suggestions: Vec<String> = templates_for_role(role)
        .iter()
        .take(3)
        .map(|t| format!("- {}", t.name))
        .collect();
    let scope = match role {
        Role::Student => "your applications, your profile, open jobs and companies",
        Role::Company => "your job postings, the applications they received and your applicants",
        Role::Admin => "students, companies, jobs and applications across the platform",
    };

    match intent {
        Intent::Greeting => format!(
            "Hi! I'm your placement analytics assistant. Ask me a question about {scope}, \
             or try one of these:\n{}",
            suggestions.join("\n")
        ),
        Intent::Help | Intent::Data => format!(
            "I turn plain-English questions into charts and tables. I can answer questions \
             about {scope}. Describe what you want to see, for example counts, trends over \
             time or top-10 lists. Some questions to start with:\n{}",
            suggestions.join("\n")
        ),
    }
}
