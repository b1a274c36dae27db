use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, get_assessment, get_template, now_rfc3339, required_str, student_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

struct SubmittedAnswer {
    question_id: String,
    answer: serde_json::Value,
}

fn parse_batch(req: &Request) -> Result<Vec<SubmittedAnswer>, serde_json::Value> {
    let Some(raw) = req.params.get("responses").and_then(|v| v.as_array()) else {
        return Err(err(
            &req.id,
            "validation_error",
            "responses must be an array",
            None,
        ));
    };
    if raw.is_empty() {
        return Err(err(
            &req.id,
            "validation_error",
            "responses must not be empty",
            None,
        ));
    }

    let mut batch = Vec::with_capacity(raw.len());
    let mut seen: HashSet<String> = HashSet::new();
    for (i, item) in raw.iter().enumerate() {
        let Some(question_id) = item.get("questionId").and_then(|v| v.as_str()) else {
            return Err(err(
                &req.id,
                "validation_error",
                format!("responses[{}] is missing questionId", i),
                None,
            ));
        };
        if !seen.insert(question_id.to_string()) {
            return Err(err(
                &req.id,
                "validation_error",
                "duplicate questionId in batch",
                Some(json!({ "questionId": question_id })),
            ));
        }
        batch.push(SubmittedAnswer {
            question_id: question_id.to_string(),
            answer: item.get("answer").cloned().unwrap_or(serde_json::Value::Null),
        });
    }
    Ok(batch)
}

fn handle_responses_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let complete = req
        .params
        .get("complete")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);

    let batch = match parse_batch(req) {
        Ok(b) => b,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }

    let template = match get_template(conn, &assessment.template_id) {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };
    let by_id: HashMap<&str, &scoring::Question> = template
        .questions
        .iter()
        .map(|q| (q.question_id.as_str(), q))
        .collect();

    // Reject the whole batch before any row is written. A partial write
    // would leave the ledger claiming answers the student never gave.
    for item in &batch {
        if !by_id.contains_key(item.question_id.as_str()) {
            return err(
                &req.id,
                "invalid_question",
                "question is not part of this assessment's template",
                Some(json!({ "questionId": item.question_id })),
            );
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Re-check completion inside the transaction. Once any row for this
    // (assessment, student) pair carries completed_at, the submission is
    // final and cannot be replaced.
    let already_done: i64 = match tx.query_row(
        "SELECT COUNT(*) FROM responses
         WHERE assessment_id = ? AND student_id = ? AND completed_at IS NOT NULL",
        (&assessment_id, &student_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => {
            let _ = tx.rollback();
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    };
    if already_done > 0 {
        let _ = tx.rollback();
        return err(
            &req.id,
            "already_completed",
            "student has already completed this assessment",
            Some(json!({ "assessmentId": assessment_id, "studentId": student_id })),
        );
    }

    // A new batch replaces any draft wholesale.
    if let Err(e) = tx.execute(
        "DELETE FROM responses WHERE assessment_id = ? AND student_id = ?",
        (&assessment_id, &student_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }

    let now = now_rfc3339();
    let completed_at = if complete { Some(now.as_str()) } else { None };

    let mut total_score = 0.0;
    let mut rows = Vec::with_capacity(batch.len());
    for item in &batch {
        let question = by_id[item.question_id.as_str()];
        let score = scoring::score(&item.answer, question);
        total_score += score;

        let answer_text = item.answer.to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO responses(id, assessment_id, student_id, question_id,
                                   question_text, answer, score, completed_at, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &assessment_id,
                &student_id,
                &item.question_id,
                &question.question_text,
                &answer_text,
                score,
                completed_at,
                &now,
            ),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "responses" })),
            );
        }

        rows.push(json!({
            "questionId": item.question_id,
            "score": score
        }));
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "rows": rows,
            "totalScore": total_score,
            "completed": complete,
            "completedAt": if complete { json!(now) } else { serde_json::Value::Null }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "responses.submit" => Some(handle_responses_submit(state, req)),
        _ => None,
    }
}
