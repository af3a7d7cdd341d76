use chrono::{DateTime, Utc};

use quizlink::call::session::AnswerValidation;
use quizlink::error::Error;
use quizlink::quiz::{AnswerGrader, QuestionRecord};
use quizlink::sync::Arc;

/// Token the grading oracle is instructed to lead with. Matched by
/// case-sensitive substring, so "Incorrect" does not count as a pass.
pub const SUCCESS_TOKEN: &str = "Correct";

/// A final transcript waiting on the grading oracle.
pub struct PendingAnswer {
    pub transcript: String,
    pub at: DateTime<Utc>,
}

/// Turns a final transcript into a graded `AnswerValidation` by way of the
/// injected oracle. The verdict text doubles as the explanation shown to both
/// parties.
#[derive(Clone)]
pub struct AnswerPipeline {
    grader: Arc<dyn AnswerGrader>,
}

impl AnswerPipeline {
    pub fn new(grader: Arc<dyn AnswerGrader>) -> Self {
        Self { grader }
    }

    pub async fn submit(
        &self,
        question: &QuestionRecord,
        transcript: &str,
    ) -> Result<AnswerValidation, Error> {
        let answer = transcript.trim();
        let verdict = self.grader.grade(&question.prompt, answer).await?;
        if verdict.trim().is_empty() {
            return Err(Error::MalformedVerdict);
        }
        Ok(AnswerValidation {
            answer: answer.to_string(),
            is_correct: verdict.contains(SUCCESS_TOKEN),
            explanation: verdict,
        })
    }
}
