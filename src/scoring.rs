use serde::{Deserialize, Serialize};

/// One selectable option of a multiple-choice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub value: f64,
}

/// Closed set of question shapes. The tag is persisted inside the
/// template's question list, so renaming a variant is a data migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum QuestionKind {
    RatingScale { min: f64, max: f64 },
    LikertScale { min: f64, max: f64 },
    MultipleChoice { options: Vec<ChoiceOption> },
    YesNo,
    Text,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub question_id: String,
    pub question_text: String,
    #[serde(default)]
    pub required: bool,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    /// Highest score this question can contribute. Text questions never
    /// contribute to numeric totals.
    pub fn max_score(&self) -> f64 {
        match &self.kind {
            QuestionKind::RatingScale { max, .. } | QuestionKind::LikertScale { max, .. } => *max,
            QuestionKind::MultipleChoice { options } => options
                .iter()
                .map(|o| o.value)
                .fold(0.0, |acc, v| if v > acc { v } else { acc }),
            QuestionKind::YesNo => 1.0,
            QuestionKind::Text => 0.0,
        }
    }

    pub fn is_scorable(&self) -> bool {
        !matches!(self.kind, QuestionKind::Text)
    }
}

/// Pure scoring: (answer, question) -> score. Deliberately lenient — an
/// unscorable answer degrades to 0.0, it never aborts the submission.
pub fn score(answer: &serde_json::Value, question: &Question) -> f64 {
    match &question.kind {
        QuestionKind::RatingScale { .. } | QuestionKind::LikertScale { .. } => {
            // No clamping: an out-of-range answer is accepted as-is.
            answer.as_f64().unwrap_or(0.0)
        }
        QuestionKind::MultipleChoice { options } => match option_key(answer) {
            Some(key) => options
                .iter()
                .find(|o| o.id == key)
                .map(|o| o.value)
                .unwrap_or(0.0),
            None => 0.0,
        },
        QuestionKind::YesNo => {
            if is_truthy(answer) {
                1.0
            } else {
                0.0
            }
        }
        QuestionKind::Text => 0.0,
    }
}

/// Normalize an answer value into an option-id key. Numeric answers match
/// options whose id is the same number written in canonical form.
fn option_key(answer: &serde_json::Value) -> Option<String> {
    match answer {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(i.to_string())
            } else {
                n.as_f64().map(|f| f.to_string())
            }
        }
        _ => None,
    }
}

fn is_truthy(answer: &serde_json::Value) -> bool {
    match answer {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Null => false,
    }
}

pub fn parse_questions(raw: &serde_json::Value) -> Result<Vec<Question>, String> {
    let Some(arr) = raw.as_array() else {
        return Err("questions must be an array".to_string());
    };
    if arr.is_empty() {
        return Err("questions must not be empty".to_string());
    }
    let questions: Vec<Question> = serde_json::from_value(raw.clone())
        .map_err(|e| format!("malformed question definition: {}", e))?;
    validate_questions(&questions)?;
    Ok(questions)
}

pub fn validate_questions(questions: &[Question]) -> Result<(), String> {
    let mut seen = std::collections::HashSet::new();
    for q in questions {
        let qid = q.question_id.trim();
        if qid.is_empty() {
            return Err("question_id must not be empty".to_string());
        }
        if !seen.insert(qid.to_string()) {
            return Err(format!("duplicate question_id: {}", qid));
        }
        if q.question_text.trim().is_empty() {
            return Err(format!("question {} has empty question_text", qid));
        }
        match &q.kind {
            QuestionKind::RatingScale { min, max } | QuestionKind::LikertScale { min, max } => {
                if !(min < max) {
                    return Err(format!("question {} requires min < max", qid));
                }
            }
            QuestionKind::MultipleChoice { options } => {
                if options.is_empty() {
                    return Err(format!("question {} has no options", qid));
                }
                let mut option_ids = std::collections::HashSet::new();
                for o in options {
                    if o.id.trim().is_empty() {
                        return Err(format!("question {} has an option with empty id", qid));
                    }
                    if !option_ids.insert(o.id.as_str()) {
                        return Err(format!("question {} has duplicate option id {}", qid, o.id));
                    }
                }
            }
            QuestionKind::YesNo | QuestionKind::Text => {}
        }
    }
    Ok(())
}
