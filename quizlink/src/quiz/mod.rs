//! Question content and answer grading collaborators.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// One quiz question as returned by the content service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct QuestionRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// The text read aloud and sent to the grading oracle.
    pub prompt: String,
}

impl QuestionRecord {
    pub fn new<S: Into<String>>(prompt: S) -> Self {
        Self {
            id: None,
            prompt: prompt.into(),
        }
    }
}

/// Question content service.
#[async_trait]
pub trait QuestionSource: Send + Sync {
    /// The complete ordered question list.
    async fn fetch_all(&self) -> Result<Vec<QuestionRecord>, Error>;
    async fn fetch_by_id(&self, id: u64) -> Result<QuestionRecord, Error>;
}

/// Judges a spoken answer against the question it was given for. Returns
/// free verdict text; the caller decides correctness from it.
#[async_trait]
pub trait AnswerGrader: Send + Sync {
    async fn grade(&self, question: &str, answer: &str) -> Result<String, Error>;
}
