use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, get_assessment, get_template, required_str};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use serde_json::json;
use std::collections::{BTreeMap, HashSet};

struct ResponseRow {
    student_id: String,
    question_id: String,
    answer: String,
    score: f64,
    completed_at: Option<String>,
}

fn load_responses(
    conn: &rusqlite::Connection,
    assessment_id: &str,
) -> Result<Vec<ResponseRow>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT student_id, question_id, answer, score, completed_at
         FROM responses
         WHERE assessment_id = ?
         ORDER BY student_id, question_id",
    )?;
    let rows = stmt.query_map([assessment_id], |row| {
        Ok(ResponseRow {
            student_id: row.get(0)?,
            question_id: row.get(1)?,
            answer: row.get(2)?,
            score: row.get(3)?,
            completed_at: row.get(4)?,
        })
    })?;
    rows.collect()
}

fn handle_monitoring_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let template = match get_template(conn, &assessment.template_id) {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };
    let template_questions: HashSet<&str> = template
        .questions
        .iter()
        .map(|q| q.question_id.as_str())
        .collect();

    let responses = match load_responses(conn, &assessment_id) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Per-student answered-question sets, running totals, and whether the
    // batch carries the completion marker.
    let mut by_student: BTreeMap<String, (HashSet<String>, f64, bool)> = BTreeMap::new();
    for r in &responses {
        let entry = by_student
            .entry(r.student_id.clone())
            .or_insert_with(|| (HashSet::new(), 0.0, false));
        entry.0.insert(r.question_id.clone());
        entry.1 += r.score;
        entry.2 |= r.completed_at.is_some();
    }

    let excluded: HashSet<&str> = assessment
        .excluded_students
        .iter()
        .map(|s| s.as_str())
        .collect();

    // A school-wide assessment has no roster to check against; responses
    // are reported as-is and the completion rate stays at zero.
    let rosterless = assessment.class_id.is_none();
    let roster = if let Some(class_id) = assessment.class_id.as_deref() {
        match db::students_in_class(conn, class_id) {
            Ok(r) => r,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    } else {
        Vec::new()
    };

    let mut expected_ids: HashSet<&str> = HashSet::new();
    let mut not_started = Vec::new();
    let mut completed = Vec::new();
    let mut incomplete = Vec::new();

    for student in &roster {
        if excluded.contains(student.id.as_str()) {
            continue;
        }
        expected_ids.insert(student.id.as_str());

        let Some((answered, total, finished)) = by_student.get(&student.id) else {
            not_started.push(json!({
                "studentId": student.id,
                "name": student.display_name
            }));
            continue;
        };

        // Completed means the answered set matches AND the batch carries
        // the completion marker. A full draft is still resubmittable, so
        // it stays in the incomplete bucket until the student commits.
        let answered_refs: HashSet<&str> = answered.iter().map(|s| s.as_str()).collect();
        if answered_refs == template_questions && *finished {
            completed.push(json!({
                "studentId": student.id,
                "name": student.display_name,
                "totalScore": *total
            }));
        } else {
            let mut missing: Vec<&str> = template_questions
                .difference(&answered_refs)
                .copied()
                .collect();
            let mut extra: Vec<&str> = answered_refs
                .difference(&template_questions)
                .copied()
                .collect();
            missing.sort_unstable();
            extra.sort_unstable();
            incomplete.push(json!({
                "studentId": student.id,
                "name": student.display_name,
                "totalScore": *total,
                "missingQuestions": missing,
                "extraQuestions": extra,
                "inProgress": !*finished
            }));
        }
    }

    // Responses from excluded students or from outside the roster are
    // kept in the ledger but flagged here instead of counted. With no
    // roster at all there is nobody to be "unexpected" against, so the
    // same entries go out as plain respondents.
    let mut unexpected = Vec::new();
    let mut respondents = Vec::new();
    for (student_id, (answered, total, _)) in &by_student {
        if expected_ids.contains(student_id.as_str()) {
            continue;
        }
        let name = match db::student_display_name(conn, student_id) {
            Ok(n) => n,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let entry = json!({
            "studentId": student_id,
            "name": name,
            "excluded": excluded.contains(student_id.as_str()),
            "questionCount": answered.len(),
            "totalScore": *total
        });
        if rosterless {
            respondents.push(entry);
        } else {
            unexpected.push(entry);
        }
    }

    let expected_count = expected_ids.len();
    let completion_rate = if expected_count > 0 {
        (completed.len() as f64 / expected_count as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "title": assessment.title,
            "templateId": template.id,
            "templateName": template.name,
            "rosterless": rosterless,
            "expectedCount": expected_count,
            "completedCount": completed.len(),
            "completionRate": completion_rate,
            "notStarted": not_started,
            "completed": completed,
            "incomplete": incomplete,
            "unexpected": unexpected,
            "respondents": respondents
        }),
    )
}

fn handle_question_breakdown(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };
    let template = match get_template(conn, &assessment.template_id) {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };

    let responses = match load_responses(conn, &assessment_id) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Answers to questions no longer on the template are dropped from the
    // breakdown; the monitoring report is where that drift shows up.
    let mut questions = Vec::with_capacity(template.questions.len());
    for question in &template.questions {
        let mut scores = Vec::new();
        let mut answers = Vec::new();
        for r in &responses {
            if r.question_id != question.question_id {
                continue;
            }
            scores.push(r.score);
            let answer: serde_json::Value =
                serde_json::from_str(&r.answer).unwrap_or(serde_json::Value::Null);
            answers.push(json!({
                "studentId": r.student_id,
                "answer": answer,
                "score": r.score
            }));
        }

        let score_stats = if question.is_scorable() && !scores.is_empty() {
            let d = stats::describe(&scores);
            json!({ "mean": d.mean, "min": d.min, "max": d.max })
        } else {
            json!({ "mean": null, "min": null, "max": null })
        };

        questions.push(json!({
            "questionId": question.question_id,
            "questionText": question.question_text,
            "responseCount": answers.len(),
            "stats": score_stats,
            "answers": answers
        }));
    }

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "templateId": template.id,
            "questions": questions
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "monitoring.report" => Some(handle_monitoring_report(state, req)),
        "monitoring.questionBreakdown" => Some(handle_question_breakdown(state, req)),
        _ => None,
    }
}
