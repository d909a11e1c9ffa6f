//! Quiz detection over the inbound message stream.
//!
//! Two shapes are recognized, both only from the configured quiz source:
//! - lettered text: question lines followed by `A) ...`, `B) ...` option lines
//! - announcement: quiz boilerplate (indicator + time limit + reward) whose
//!   options are inline buttons
//!
//! Everything else is "not a quiz" and is dropped without side effects.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::{InboundMessage, QuizMessage, UserId};

const QUIZ_INDICATORS: &[&str] = &[
    "quick quiz",
    "emoji puzzle",
    "answer within",
    "choose the correct option below",
];
const TIME_INDICATORS: &[&str] = &["⏳", "minutes"];
const REWARD_INDICATORS: &[&str] = &["reward:", "wheel of fortune", "spin"];

// Lines that belong to the announcement frame, never to the question.
const BOILERPLATE: &[&str] = &[
    "quick quiz",
    "emoji puzzle",
    "reward:",
    "make sure",
    "choose the correct",
    "answer within",
    "add our bot",
    "do not share",
    "spin for all",
];

const INTERROGATIVES: &[&str] = &["what", "which", "who", "how", "when", "where"];

const MIN_QUESTION_LEN: usize = 10;
const MIN_FALLBACK_LEN: usize = 20;
const MAX_EMOJI_LINE_LEN: usize = 50;

fn option_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-E])\s*[\).:]\s*(\S.*)$").expect("valid regex"))
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\p{L}']+").expect("valid regex"))
}

#[derive(Clone, Copy, Debug)]
pub struct QuizDetector {
    source_id: UserId,
}

impl QuizDetector {
    pub fn new(source_id: UserId) -> Self {
        Self { source_id }
    }

    pub fn source_id(&self) -> UserId {
        self.source_id
    }

    pub fn detect(&self, msg: &InboundMessage) -> Option<QuizMessage> {
        let sender = msg.sender_id?;
        if sender != self.source_id {
            return None;
        }

        let (text, options) = parse_lettered(&msg.text).or_else(|| {
            if msg.buttons.len() < 2 || !is_announcement(&msg.text) {
                return None;
            }
            let question = extract_question(&msg.text)?;
            let options = msg
                .buttons
                .iter()
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty())
                .collect::<Vec<_>>();
            (options.len() >= 2).then_some((question, options))
        })?;

        Some(QuizMessage {
            channel: msg.chat_id,
            message_id: msg.message_id,
            sender_id: sender,
            text,
            options,
            arrived_at: msg.sent_at,
        })
    }
}

/// Question lines followed by consecutive `A)`, `B)`, ... option lines.
///
/// Options must start at `A` and run in order; anything after the last option
/// is ignored. A lettered line before `A)` counts as question text.
pub fn parse_lettered(text: &str) -> Option<(String, Vec<String>)> {
    let mut question_lines = Vec::new();
    let mut options: Vec<String> = Vec::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let expected = (b'A' + options.len() as u8) as char;
        match option_re().captures(line) {
            Some(caps) if caps[1].starts_with(expected) => {
                options.push(caps[2].trim().to_string());
            }
            _ if options.is_empty() => question_lines.push(line),
            _ => break,
        }
    }

    let question = question_lines.join(" ");
    if question.is_empty() || options.len() < 2 {
        return None;
    }
    Some((question, options))
}

pub fn is_announcement(text: &str) -> bool {
    let lower = text.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| lower.contains(n));
    any(QUIZ_INDICATORS) && any(TIME_INDICATORS) && any(REWARD_INDICATORS)
}

/// Pull the question out of an announcement.
pub fn extract_question(text: &str) -> Option<String> {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let content: Vec<&str> = lines
        .iter()
        .copied()
        .filter(|l| !is_boilerplate(l))
        .collect();

    let lower = text.to_lowercase();
    if lower.contains("emoji puzzle") || text.contains('🧩') {
        if let Some(q) = emoji_puzzle_question(&content) {
            return Some(q);
        }
    }

    for line in &content {
        if looks_like_question(line) {
            let cleaned = strip_leading_decoration(line);
            if cleaned.chars().count() > MIN_QUESTION_LEN {
                return Some(cleaned.to_string());
            }
        }
    }

    content
        .iter()
        .find(|l| l.chars().count() > MIN_FALLBACK_LEN)
        .map(|l| l.to_string())
}

fn emoji_puzzle_question(content: &[&str]) -> Option<String> {
    let question = content.iter().copied().find(|l| {
        let lower = l.to_lowercase();
        lower.contains("what") && (lower.contains("emoji") || lower.contains("represent"))
    });

    let emoji_line = content.iter().copied().find(|l| {
        Some(*l) != question
            && l.chars().count() <= MAX_EMOJI_LINE_LEN
            && l.chars().filter(|c| is_emoji(*c)).count() >= 2
    });

    match (question, emoji_line) {
        (Some(q), Some(e)) => Some(format!("{} {}", strip_leading_decoration(q), e)),
        (None, Some(e)) => Some(format!("What do these emojis represent? {e}")),
        (Some(q), None) => Some(strip_leading_decoration(q).to_string()),
        (None, None) => None,
    }
}

fn is_boilerplate(line: &str) -> bool {
    let lower = line.to_lowercase();
    BOILERPLATE.iter().any(|b| lower.contains(b))
}

fn looks_like_question(line: &str) -> bool {
    if line.ends_with('?') {
        return true;
    }
    let lower = line.to_lowercase();
    word_re()
        .find_iter(&lower)
        .any(|w| INTERROGATIVES.contains(&w.as_str()))
}

fn strip_leading_decoration(line: &str) -> &str {
    line.trim_start_matches(|c: char| is_emoji(c) || c.is_whitespace() || c == '\u{fe0f}')
        .trim()
}

fn is_emoji(c: char) -> bool {
    matches!(
        c as u32,
        0x1F000..=0x1FAFF | 0x2300..=0x23FF | 0x25A0..=0x27EF | 0x2B00..=0x2BFF
    )
}
