use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use crate::scoring::Question;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(
        code: &'static str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        HandlerErr {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn query(e: rusqlite::Error) -> Self {
        HandlerErr::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn opt_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[derive(Debug, Clone)]
pub struct TemplateRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub questions: Vec<Question>,
    pub scoring_rules: Option<serde_json::Value>,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub active: bool,
}

pub fn get_template(conn: &Connection, template_id: &str) -> Result<TemplateRow, HandlerErr> {
    let row: Option<(
        String,
        Option<String>,
        Option<String>,
        String,
        Option<String>,
        String,
        String,
        Option<String>,
        i64,
    )> = conn
        .query_row(
            "SELECT name, description, category, questions, scoring_rules,
                    created_by, created_at, updated_at, active
             FROM templates
             WHERE id = ?",
            [template_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let Some((
        name,
        description,
        category,
        questions_raw,
        scoring_rules_raw,
        created_by,
        created_at,
        updated_at,
        active,
    )) = row
    else {
        return Err(HandlerErr::new("not_found", "template not found"));
    };

    let questions: Vec<Question> = serde_json::from_str(&questions_raw).map_err(|e| {
        HandlerErr::with_details(
            "db_query_failed",
            format!("stored questions are unreadable: {}", e),
            json!({ "templateId": template_id }),
        )
    })?;
    let scoring_rules = match scoring_rules_raw {
        Some(raw) => serde_json::from_str(&raw).ok(),
        None => None,
    };

    Ok(TemplateRow {
        id: template_id.to_string(),
        name,
        description,
        category,
        questions,
        scoring_rules,
        created_by,
        created_at,
        updated_at,
        active: active != 0,
    })
}

#[derive(Debug, Clone)]
pub struct AssessmentRow {
    pub id: String,
    pub template_id: String,
    pub class_id: Option<String>,
    pub school_id: Option<String>,
    pub title: String,
    pub excluded_students: Vec<String>,
    pub created_by: String,
    pub created_at: String,
}

pub fn get_assessment(conn: &Connection, assessment_id: &str) -> Result<AssessmentRow, HandlerErr> {
    let row: Option<(
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        String,
        String,
    )> = conn
        .query_row(
            "SELECT template_id, class_id, school_id, title, excluded_students,
                    created_by, created_at
             FROM assessments
             WHERE id = ?",
            [assessment_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                ))
            },
        )
        .optional()
        .map_err(HandlerErr::query)?;

    let Some((template_id, class_id, school_id, title, excluded_raw, created_by, created_at)) = row
    else {
        return Err(HandlerErr::new("not_found", "assessment not found"));
    };

    Ok(AssessmentRow {
        id: assessment_id.to_string(),
        template_id,
        class_id,
        school_id,
        title,
        excluded_students: parse_excluded(&excluded_raw),
        created_by,
        created_at,
    })
}

pub fn parse_excluded(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map_err(HandlerErr::query)
    .map(|v| v.is_some())
}
