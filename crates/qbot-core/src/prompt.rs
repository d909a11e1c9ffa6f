//! Assistant prompt for a quiz question.

use std::time::Duration;

use crate::domain::{Letter, QuizMessage};

const TEMPLATE: &str = "QUIZ ANALYSIS - you have {research_secs} seconds.

Question: {question}

{options}
How to work:
- search for the key terms of the question
- eliminate options that are clearly wrong
- emoji clues often point at movies, games, crypto or pop culture

RESPONSE FORMAT (strict):
- reply with exactly one letter ({letters})
- no explanation, no formatting, no repetition
- correct: B
- wrong: \"B because...\", \"BB\"";

/// Render the prompt sent to the assistant for `quiz`.
pub fn render(quiz: &QuizMessage, research_window: Duration) -> String {
    let mut options = String::new();
    for (idx, text) in quiz.options.iter().enumerate() {
        let Some(letter) = Letter::from_index(idx) else {
            break;
        };
        options.push_str(&format!("{letter}) {text}\n"));
    }

    let shown = quiz.options.len().clamp(1, Letter::ALL.len());
    let letters = Letter::ALL[..shown]
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(", ");

    TEMPLATE
        .replace("{research_secs}", &research_window.as_secs().to_string())
        .replace("{question}", quiz.text.trim())
        .replace("{options}", &options)
        .replace("{letters}", &letters)
}
