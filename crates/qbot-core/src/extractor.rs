//! Assistant reply -> answer letter.
//!
//! Strategies run in a fixed order and the first hit wins; explicit signals
//! outrank weaker ones.

use std::sync::OnceLock;

use regex::Regex;

use crate::domain::Letter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// `Answer: B`, `the answer is C`.
    Explicit,
    /// A line holding nothing but one letter.
    LoneLine,
    /// One letter closing the text.
    Trailing,
    /// Any uppercase letter token bounded by non-letters.
    Standalone,
}

type StrategyFn = fn(&str) -> Option<Letter>;

const STRATEGIES: [(Strategy, StrategyFn); 4] = [
    (Strategy::Explicit, explicit),
    (Strategy::LoneLine, lone_line),
    (Strategy::Trailing, trailing),
    (Strategy::Standalone, standalone),
];

pub fn extract(reply: &str) -> Option<Letter> {
    extract_with_strategy(reply).map(|(letter, _)| letter)
}

pub fn extract_with_strategy(reply: &str) -> Option<(Letter, Strategy)> {
    let reply = reply.trim();
    if reply.is_empty() {
        return None;
    }
    STRATEGIES
        .iter()
        .find_map(|(name, f)| f(reply).map(|letter| (letter, *name)))
}

fn compiled(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("valid regex"))
}

fn first_letter(re: &Regex, text: &str) -> Option<Letter> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().chars().next())
        .and_then(Letter::from_char)
}

/// A lowercase letter only counts when a colon, dash or markup sets it off,
/// so "the answer is a tricky one" is not read as option A.
pub fn explicit(text: &str) -> Option<Letter> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = compiled(
        &RE,
        r"\b(?i:answer)(?:\s+(?i:is))?(\s*[:\-]?\s*[*_(\[]*)([A-Ea-e])(?:[^\p{L}]|$)",
    );
    re.captures_iter(text).find_map(|c| {
        let sep = c.get(1).map_or("", |m| m.as_str());
        let ch = c.get(2)?.as_str().chars().next()?;
        let marked = sep.contains(|p: char| !p.is_whitespace());
        if ch.is_ascii_lowercase() && !marked {
            return None;
        }
        Letter::from_char(ch)
    })
}

pub fn lone_line(text: &str) -> Option<Letter> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = compiled(&RE, r"^[*_(\[]*([A-Ea-e])[*_)\].!]*$");
    text.lines().find_map(|line| first_letter(re, line.trim()))
}

pub fn trailing(text: &str) -> Option<Letter> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = compiled(&RE, r"(?:^|[^\p{L}\p{N}])([A-Ea-e])[*_)\].!\s]*$");
    first_letter(re, text)
}

pub fn standalone(text: &str) -> Option<Letter> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = compiled(&RE, r"(?:^|[^\p{L}])([A-E])(?:[^\p{L}]|$)");
    first_letter(re, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_answer_colon() {
        assert_eq!(
            extract_with_strategy("Answer: B"),
            Some((Letter::B, Strategy::Explicit))
        );
    }

    #[test]
    fn explicit_answer_is_inside_prose() {
        assert_eq!(
            extract_with_strategy("The answer is C, based on research."),
            Some((Letter::C, Strategy::Explicit))
        );
        assert_eq!(extract("Correct answer: **d**"), Some(Letter::D));
    }

    #[test]
    fn explicit_beats_lone_line() {
        let reply = "A\n\nOn reflection the answer is E.";
        assert_eq!(extract(reply), Some(Letter::E));
    }

    #[test]
    fn article_after_answer_is_not_a_letter() {
        assert_eq!(
            extract_with_strategy("The answer is a tricky one to pin down.\nAnswer: D"),
            Some((Letter::D, Strategy::Explicit))
        );
        assert_eq!(explicit("the answer is a planet"), None);
        assert_eq!(explicit("answer: a"), Some(Letter::A));
        assert_eq!(explicit("The answer is A."), Some(Letter::A));
    }

    #[test]
    fn lone_line_in_multiline_reply() {
        let reply = "Let me think about the options.\nThe second seems unlikely.\n\nD";
        assert_eq!(
            extract_with_strategy(reply),
            Some((Letter::D, Strategy::LoneLine))
        );
    }

    #[test]
    fn lone_line_tolerates_markup() {
        assert_eq!(lone_line("**b**"), Some(Letter::B));
        assert_eq!(lone_line("(C)"), Some(Letter::C));
        assert_eq!(lone_line("AA"), None);
    }

    #[test]
    fn trailing_letter_closes_text() {
        assert_eq!(
            extract_with_strategy("After weighing them I pick C."),
            Some((Letter::C, Strategy::Trailing))
        );
        assert_eq!(trailing("go with option c"), Some(Letter::C));
        assert_eq!(trailing("C3"), None);
    }

    #[test]
    fn standalone_token_is_last_resort() {
        assert_eq!(
            extract_with_strategy("Option B looks right to me, honestly."),
            Some((Letter::B, Strategy::Standalone))
        );
        // lowercase articles never count as a standalone answer
        assert_eq!(standalone("it is a planet"), None);
        // bounded by non-letters, digits included
        assert_eq!(standalone("pick D3 now"), Some(Letter::D));
    }

    #[test]
    fn no_letter_pattern_is_no_match() {
        assert_eq!(extract("I am not sure about this one, sorry."), None);
        assert_eq!(extract(""), None);
        assert_eq!(extract("   \n  "), None);
        assert_eq!(extract("Fantastic question!"), None);
    }
}
