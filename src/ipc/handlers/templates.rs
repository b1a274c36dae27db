use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, get_template, now_rfc3339, opt_str, required_str, TemplateRow};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use serde_json::json;
use uuid::Uuid;

fn template_json(t: &TemplateRow) -> serde_json::Value {
    json!({
        "templateId": t.id,
        "name": t.name,
        "description": t.description,
        "category": t.category,
        "questions": serde_json::to_value(&t.questions).unwrap_or(serde_json::Value::Null),
        "scoringRules": t.scoring_rules,
        "createdBy": t.created_by,
        "createdAt": t.created_at,
        "updatedAt": t.updated_at,
        "active": t.active
    })
}

fn handle_templates_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let name = match required_str(req, "name") {
        Ok(v) => v.trim().to_string(),
        Err(resp) => return resp,
    };
    if name.is_empty() {
        return err(&req.id, "validation_error", "name must not be empty", None);
    }
    let created_by = match required_str(req, "createdBy") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let Some(questions_raw) = req.params.get("questions") else {
        return err(&req.id, "validation_error", "missing questions", None);
    };
    let questions = match scoring::parse_questions(questions_raw) {
        Ok(qs) => qs,
        Err(msg) => return err(&req.id, "validation_error", msg, None),
    };

    let description = opt_str(req, "description");
    let category = opt_str(req, "category");
    let scoring_rules = req
        .params
        .get("scoringRules")
        .filter(|v| !v.is_null())
        .map(|v| v.to_string());

    let questions_text = match serde_json::to_string(&questions) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };

    let template_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO templates(id, name, description, category, questions, scoring_rules,
                               created_by, created_at, active)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1)",
        (
            &template_id,
            &name,
            &description,
            &category,
            &questions_text,
            &scoring_rules,
            &created_by,
            now_rfc3339(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "templates" })),
        );
    }

    ok(
        &req.id,
        json!({ "templateId": template_id, "questionCount": questions.len() }),
    )
}

fn handle_templates_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let mut current = match get_template(conn, &template_id) {
        Ok(t) => t,
        Err(e) => return e.response(&req.id),
    };

    // Only provided fields are replaced. A new question list silently
    // reinterprets historical scores; the monitoring report surfaces the
    // drift as missing/extra questions rather than blocking the edit.
    if let Some(name) = opt_str(req, "name") {
        current.name = name;
    }
    if let Some(v) = req.params.get("description") {
        current.description = v.as_str().map(|s| s.to_string());
    }
    if let Some(v) = req.params.get("category") {
        current.category = v.as_str().map(|s| s.to_string());
    }
    if let Some(v) = req.params.get("scoringRules") {
        current.scoring_rules = if v.is_null() { None } else { Some(v.clone()) };
    }
    if let Some(questions_raw) = req.params.get("questions") {
        match scoring::parse_questions(questions_raw) {
            Ok(qs) => current.questions = qs,
            Err(msg) => return err(&req.id, "validation_error", msg, None),
        }
    }

    let questions_text = match serde_json::to_string(&current.questions) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "internal", e.to_string(), None),
    };
    let scoring_rules_text = current.scoring_rules.as_ref().map(|v| v.to_string());
    let updated_at = now_rfc3339();

    if let Err(e) = conn.execute(
        "UPDATE templates
         SET name = ?, description = ?, category = ?, questions = ?,
             scoring_rules = ?, updated_at = ?
         WHERE id = ?",
        (
            &current.name,
            &current.description,
            &current.category,
            &questions_text,
            &scoring_rules_text,
            &updated_at,
            &template_id,
        ),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "templates" })),
        );
    }

    ok(
        &req.id,
        json!({ "templateId": template_id, "updatedAt": updated_at }),
    )
}

fn handle_templates_deactivate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let changed = match conn.execute(
        "UPDATE templates SET active = 0, updated_at = ? WHERE id = ?",
        (now_rfc3339(), &template_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if changed == 0 {
        return err(&req.id, "not_found", "template not found", None);
    }

    // Deactivation does not cascade to existing assessment instances.
    ok(&req.id, json!({ "templateId": template_id, "active": false }))
}

fn handle_templates_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let template_id = match required_str(req, "templateId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match get_template(conn, &template_id) {
        Ok(t) => ok(&req.id, template_json(&t)),
        Err(e) => e.response(&req.id),
    }
}

fn handle_templates_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let category = opt_str(req, "category");
    let include_inactive = req
        .params
        .get("includeInactive")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let mut sql = String::from(
        "SELECT id, name, description, category, questions, created_by, created_at, updated_at, active
         FROM templates",
    );
    let mut clauses: Vec<&str> = Vec::new();
    if !include_inactive {
        clauses.push("active = 1");
    }
    if category.is_some() {
        clauses.push("category = ?");
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<serde_json::Value> {
        let id: String = row.get(0)?;
        let name: String = row.get(1)?;
        let description: Option<String> = row.get(2)?;
        let cat: Option<String> = row.get(3)?;
        let questions_raw: String = row.get(4)?;
        let created_by: String = row.get(5)?;
        let created_at: String = row.get(6)?;
        let updated_at: Option<String> = row.get(7)?;
        let active: i64 = row.get(8)?;
        let question_count = serde_json::from_str::<Vec<serde_json::Value>>(&questions_raw)
            .map(|v| v.len())
            .unwrap_or(0);
        Ok(json!({
            "templateId": id,
            "name": name,
            "description": description,
            "category": cat,
            "questionCount": question_count,
            "createdBy": created_by,
            "createdAt": created_at,
            "updatedAt": updated_at,
            "active": active != 0
        }))
    };

    let rows = if let Some(cat) = category {
        stmt.query_map([&cat], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    } else {
        stmt.query_map([], map_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    };

    match rows {
        Ok(templates) => ok(&req.id, json!({ "templates": templates })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.create" => Some(handle_templates_create(state, req)),
        "templates.update" => Some(handle_templates_update(state, req)),
        "templates.deactivate" => Some(handle_templates_deactivate(state, req)),
        "templates.get" => Some(handle_templates_get(state, req)),
        "templates.list" => Some(handle_templates_list(state, req)),
        _ => None,
    }
}
