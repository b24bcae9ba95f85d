//! The record threaded through every stage of a session.

use serde::{Deserialize, Serialize};

/// Outcome of grading a description against the question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grade {
    Accepted,
    Rejected,
}

impl Grade {
    /// `Accepted` iff the normalized answer is exactly "yes". Anything else,
    /// including empty or chatty answers, is a rejection.
    pub fn from_response(raw: &str) -> Self {
        let normalized = raw
            .trim()
            .trim_matches(|c: char| matches!(c, '"' | '\'' | '`'))
            .trim_end_matches(['.', '!'])
            .trim()
            .to_ascii_lowercase();
        if normalized == "yes" {
            Grade::Accepted
        } else {
            Grade::Rejected
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Grade::Accepted => "accepted",
            Grade::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    #[error("grade is set but no description exists")]
    GradeWithoutDescription,
    #[error("description is set but no sql query exists")]
    DescriptionWithoutQuery,
    #[error("sql query is set but retry_count is 0")]
    QueryWithoutAttempt,
    #[error("retry_count decreased from {before} to {after}")]
    RetryCountDecreased { before: u32, after: u32 },
    #[error("escalate reverted to false")]
    EscalationReverted,
    #[error("question changed mid-session")]
    QuestionChanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub question: String,
    pub sql_query: Option<String>,
    pub description: Option<String>,
    pub grade: Option<Grade>,
    /// Next generation uses the higher-power model. Never reverts.
    pub escalate: bool,
    /// Generation attempts so far.
    pub retry_count: u32,
}

impl PipelineState {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            sql_query: None,
            description: None,
            grade: None,
            escalate: false,
            retry_count: 0,
        }
    }

    /// Store a freshly generated query. The previous description and grade
    /// belonged to the old query and are cleared.
    pub fn record_generation(&mut self, sql_query: String) {
        self.sql_query = Some(sql_query);
        self.description = None;
        self.grade = None;
        self.retry_count += 1;
    }

    pub fn record_description(&mut self, description: String) {
        self.description = Some(description);
        self.grade = None;
    }

    pub fn record_grade(&mut self, grade: Grade) {
        self.grade = Some(grade);
    }

    pub fn escalate(&mut self) {
        self.escalate = true;
    }

    pub fn is_accepted(&self) -> bool {
        self.grade == Some(Grade::Accepted)
    }

    /// Check the invariants that hold for any single snapshot.
    pub fn validate(&self) -> Result<(), StateViolation> {
        if self.grade.is_some() && self.description.is_none() {
            return Err(StateViolation::GradeWithoutDescription);
        }
        if self.description.is_some() && self.sql_query.is_none() {
            return Err(StateViolation::DescriptionWithoutQuery);
        }
        if self.sql_query.is_some() && self.retry_count == 0 {
            return Err(StateViolation::QueryWithoutAttempt);
        }
        Ok(())
    }

    /// Check that `self` is a legal successor of `prev`.
    pub fn check_progress(&self, prev: &PipelineState) -> Result<(), StateViolation> {
        self.validate()?;
        if self.question != prev.question {
            return Err(StateViolation::QuestionChanged);
        }
        if self.retry_count < prev.retry_count {
            return Err(StateViolation::RetryCountDecreased {
                before: prev.retry_count,
                after: self.retry_count,
            });
        }
        if prev.escalate && !self.escalate {
            return Err(StateViolation::EscalationReverted);
        }
        Ok(())
    }
}
