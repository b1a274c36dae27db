use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, get_assessment, get_template, now_rfc3339, opt_str, required_str,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_assessments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if title.is_empty() {
        return err(&req.id, "validation_error", "title must not be empty", None);
    }
    let created_by = match required_str(req, "createdBy") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let class_id = opt_str(req, "classId");
    let school_id = opt_str(req, "schoolId");
    if class_id.is_none() && school_id.is_none() {
        return err(
            &req.id,
            "validation_error",
            "an assessment targets a class or a school",
            None,
        );
    }

    let template = match get_template(conn, &template_id) {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };

    if let Some(cid) = class_id.as_deref() {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [cid], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "class not found", None);
        }
    }

    let assessment_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessments(id, template_id, class_id, school_id, title,
                                 excluded_students, created_by, created_at)
         VALUES(?, ?, ?, ?, ?, '[]', ?, ?)",
        (
            &assessment_id,
            &template.id,
            &class_id,
            &school_id,
            &title,
            &created_by,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "templateId": template.id,
            "templateName": template.name,
            "title": title
        }),
    )
}

fn handle_exclusions_set(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(excluded) = req.params.get("excluded").and_then(|v| v.as_bool()) else {
        return err(&req.id, "bad_params", "missing excluded flag", None);
    };
    let actor = opt_str(req, "actor");

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(a) => a,
        Err(e) => return e.response(&req.id),
    };

    // Last-write-wins set semantics; the event row is the audit trail.
    // Excluding never touches rows already in the response ledger.
    let mut set = assessment.excluded_students.clone();
    let was_excluded = set.iter().any(|s| s == &student_id);
    if excluded && !was_excluded {
        set.push(student_id.clone());
    } else if !excluded && was_excluded {
        set.retain(|s| s != &student_id);
    }

    let excluded_text = match serde_json::to_string(&set) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "UPDATE assessments SET excluded_students = ? WHERE id = ?",
        (&excluded_text, &assessment_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    let action = if excluded { "exclude" } else { "include" };
    if let Err(e) = tx.execute(
        "INSERT INTO exclusion_events(id, assessment_id, student_id, action, actor, at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            &assessment_id,
            &student_id,
            action,
            &actor,
            now_rfc3339(),
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "exclusion_events" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "excluded": excluded,
            "excludedStudents": set
        }),
    )
}

fn handle_assessments_get(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    ok(
        &req.id,
        json!({
            "assessmentId": assessment.id,
            "templateId": assessment.template_id,
            "classId": assessment.class_id,
            "schoolId": assessment.school_id,
            "title": assessment.title,
            "excludedStudents": assessment.excluded_students,
            "createdBy": assessment.created_by,
            "createdAt": assessment.created_at
        }),
    )
}

fn handle_assessments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let class_id = opt_str(req, "classId");
    let template_id = opt_str(req, "templateId");

    let mut sql = String::from(
        "SELECT a.id, a.template_id, t.name, a.class_id, a.school_id, a.title, a.created_at
         FROM assessments a
         JOIN templates t ON t.id = a.template_id",
    );
    let mut clauses: Vec<&str> = Vec::new();
    let mut binds: Vec<&String> = Vec::new();
    if let Some(cid) = class_id.as_ref() {
        clauses.push("a.class_id = ?");
        binds.push(cid);
    }
    if let Some(tid) = template_id.as_ref() {
        clauses.push("a.template_id = ?");
        binds.push(tid);
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY a.created_at DESC");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map(rusqlite::params_from_iter(binds), |row| {
            let id: String = row.get(0)?;
            let template_id: String = row.get(1)?;
            let template_name: String = row.get(2)?;
            let class_id: Option<String> = row.get(3)?;
            let school_id: Option<String> = row.get(4)?;
            let title: String = row.get(5)?;
            let created_at: String = row.get(6)?;
            Ok(json!({
                "assessmentId": id,
                "templateId": template_id,
                "templateName": template_name,
                "classId": class_id,
                "schoolId": school_id,
                "title": title,
                "createdAt": created_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assessments) => ok(&req.id, json!({ "assessments": assessments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.create" => Some(handle_assessments_create(state, req)),
        "assessments.exclusions.set" => Some(handle_exclusions_set(state, req)),
        "assessments.get" => Some(handle_assessments_get(state, req)),
        "assessments.list" => Some(handle_assessments_list(state, req)),
        _ => None,
    }
}
