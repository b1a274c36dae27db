use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, get_assessment, get_template, opt_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::stats;
use chrono::{Duration, SecondsFormat, Utc};
use serde_json::json;
use std::collections::BTreeMap;

fn cutoff_rfc3339(days: i64) -> String {
    (Utc::now() - Duration::days(days)).to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Per-student completed totals for one assessment, keyed by student id.
fn completed_totals(
    conn: &rusqlite::Connection,
    assessment_id: &str,
) -> Result<BTreeMap<String, f64>, rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT student_id, SUM(score)
         FROM responses
         WHERE assessment_id = ? AND completed_at IS NOT NULL
         GROUP BY student_id",
    )?;
    let rows = stmt.query_map([assessment_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;
    rows.collect()
}

fn handle_analytics_assessment(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let totals = match completed_totals(conn, &assessment_id) {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scores: Vec<f64> = totals.values().copied().collect();

    // Band thresholds come from what the template can actually award, not
    // from a fixed per-question scale. All-text templates have no ceiling,
    // so fall back to the default scale to keep the buckets meaningful.
    let mut max_possible: f64 = template.questions.iter().map(|q| q.max_score()).sum();
    if max_possible <= 0.0 {
        max_possible = template.questions.len() as f64 * stats::DEFAULT_PER_QUESTION_MAX;
    }

    let mut distribution: BTreeMap<&str, usize> =
        [("low", 0), ("medium", 0), ("high", 0)].into_iter().collect();
    for score in &scores {
        let band = stats::bucket_by_max(*score, max_possible);
        *distribution.entry(band.as_str()).or_insert(0) += 1;
    }

    // Per-question stats over completed submissions only.
    let question_rows: Result<Vec<(String, f64)>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(
            "SELECT question_id, score
             FROM responses
             WHERE assessment_id = ? AND completed_at IS NOT NULL",
        )?;
        let rows = stmt.query_map([&assessment_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
        })?;
        rows.collect()
    })();
    let question_rows = match question_rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut question_analysis = Vec::with_capacity(template.questions.len());
    for question in &template.questions {
        let scores: Vec<f64> = question_rows
            .iter()
            .filter(|(qid, _)| qid == &question.question_id)
            .map(|(_, s)| *s)
            .collect();
        let d = if question.is_scorable() && !scores.is_empty() {
            let d = stats::describe(&scores);
            json!({ "mean": d.mean, "min": d.min, "max": d.max, "count": d.count })
        } else {
            json!({ "mean": null, "min": null, "max": null, "count": scores.len() })
        };
        question_analysis.push(json!({
            "questionId": question.question_id,
            "questionText": question.question_text,
            "stats": d
        }));
    }

    // Ranked results, highest total first.
    let mut ranked: Vec<(&String, f64)> = totals.iter().map(|(id, s)| (id, *s)).collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let student_results: Vec<serde_json::Value> = ranked
        .iter()
        .map(|(student_id, total)| {
            json!({
                "studentId": student_id,
                "totalScore": *total,
                "band": stats::bucket_by_max(*total, max_possible).as_str()
            })
        })
        .collect();

    let expected = if let Some(class_id) = assessment.class_id.as_deref() {
        let roster = match crate::db::students_in_class(conn, class_id) {
            Ok(r) => r,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        roster
            .iter()
            .filter(|s| !assessment.excluded_students.contains(&s.id))
            .count()
    } else {
        0
    };
    let completion_rate = if expected > 0 {
        (scores.len() as f64 / expected as f64 * 1000.0).round() / 10.0
    } else {
        0.0
    };

    ok(
        &req.id,
        json!({
            "assessmentId": assessment_id,
            "title": assessment.title,
            "templateName": template.name,
            "maxPossibleScore": max_possible,
            "statistics": stats::describe(&scores),
            "percentiles": stats::quartiles(&scores),
            "scoreDistribution": distribution,
            "questionAnalysis": question_analysis,
            "studentResults": student_results,
            "completion": {
                "expected": expected,
                "completed": scores.len(),
                "rate": completion_rate
            }
        }),
    )
}

fn handle_analytics_student(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let category = opt_str(req, "category");
    let days = req.params.get("days").and_then(|v| v.as_i64());

    let name = match crate::db::student_display_name(conn, &student_id) {
        Ok(Some(n)) => n,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut sql = String::from(
        "SELECT r.assessment_id, a.title, t.category, MAX(r.completed_at), SUM(r.score)
         FROM responses r
         JOIN assessments a ON a.id = r.assessment_id
         JOIN templates t ON t.id = a.template_id
         WHERE r.student_id = ? AND r.completed_at IS NOT NULL",
    );
    let mut binds: Vec<String> = vec![student_id.clone()];
    if let Some(cat) = category.as_ref() {
        sql.push_str(" AND t.category = ?");
        binds.push(cat.clone());
    }
    if let Some(d) = days {
        sql.push_str(" AND r.completed_at >= ?");
        binds.push(cutoff_rfc3339(d));
    }
    sql.push_str(" GROUP BY r.assessment_id ORDER BY MAX(r.completed_at)");

    let rows: Result<Vec<(String, String, Option<String>, String, f64)>, rusqlite::Error> =
        (|| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(&binds), |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            rows.collect()
        })();
    let rows = match rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let totals: Vec<f64> = rows.iter().map(|r| r.4).collect();

    let mut by_category: BTreeMap<String, Vec<f64>> = BTreeMap::new();
    for (_, _, cat, _, total) in &rows {
        by_category
            .entry(cat.clone().unwrap_or_else(|| "uncategorized".to_string()))
            .or_default()
            .push(*total);
    }
    let category_breakdown: BTreeMap<String, serde_json::Value> = by_category
        .iter()
        .map(|(cat, scores)| {
            let d = stats::describe(scores);
            (
                cat.clone(),
                json!({ "count": d.count, "mean": d.mean, "min": d.min, "max": d.max }),
            )
        })
        .collect();

    // Chronological, so the caller can chart the trajectory directly.
    let trend: Vec<serde_json::Value> = rows
        .iter()
        .map(|(assessment_id, title, cat, completed_at, total)| {
            json!({
                "assessmentId": assessment_id,
                "title": title,
                "category": cat,
                "completedAt": completed_at,
                "totalScore": *total
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "studentId": student_id,
            "name": name,
            "assessmentCount": rows.len(),
            "statistics": stats::describe(&totals),
            "categoryBreakdown": category_breakdown,
            "scoreTrend": trend
        }),
    )
}

// Narrows a query to one class or one school; class wins when both are given.
fn scope_clause(req: &Request, sql: &mut String, binds: &mut Vec<String>) {
    if let Some(class_id) = opt_str(req, "classId") {
        sql.push_str(" AND a.class_id = ?");
        binds.push(class_id);
    } else if let Some(school_id) = opt_str(req, "schoolId") {
        sql.push_str(" AND a.school_id = ?");
        binds.push(school_id);
    }
}

fn handle_analytics_category(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let mut sql = String::from(
        "SELECT COALESCE(t.category, 'uncategorized'),
                COUNT(r.score), AVG(r.score), MIN(r.score), MAX(r.score)
         FROM responses r
         JOIN assessments a ON a.id = r.assessment_id
         JOIN templates t ON t.id = a.template_id
         WHERE r.completed_at IS NOT NULL",
    );
    let mut binds: Vec<String> = Vec::new();
    scope_clause(req, &mut sql, &mut binds);
    sql.push_str(" GROUP BY COALESCE(t.category, 'uncategorized') ORDER BY 1");

    let rows: Result<Vec<(String, i64, f64, f64, f64)>, rusqlite::Error> = (|| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(&binds), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
            ))
        })?;
        rows.collect()
    })();
    let rows = match rows {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let categories: Vec<serde_json::Value> = rows
        .iter()
        .map(|(cat, count, avg, min, max)| {
            json!({
                "category": cat,
                "responseCount": count,
                "averageScore": stats::round2(*avg),
                "minScore": min,
                "maxScore": max
            })
        })
        .collect();

    ok(&req.id, json!({ "categories": categories }))
}

fn window_scores(
    conn: &rusqlite::Connection,
    req: &Request,
    category: Option<&String>,
    from: &str,
    to: Option<&str>,
) -> Result<Vec<f64>, rusqlite::Error> {
    let mut sql = String::from(
        "SELECT r.score
         FROM responses r
         JOIN assessments a ON a.id = r.assessment_id
         JOIN templates t ON t.id = a.template_id
         WHERE r.completed_at IS NOT NULL AND r.completed_at >= ?",
    );
    let mut binds: Vec<String> = vec![from.to_string()];
    if let Some(to) = to {
        sql.push_str(" AND r.completed_at < ?");
        binds.push(to.to_string());
    }
    if let Some(cat) = category {
        sql.push_str(" AND t.category = ?");
        binds.push(cat.clone());
    }
    scope_clause(req, &mut sql, &mut binds);

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(&binds), |row| {
        row.get::<_, f64>(0)
    })?;
    rows.collect()
}

fn handle_analytics_trend(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let category = opt_str(req, "category");

    let recent_cutoff = cutoff_rfc3339(30);
    let previous_cutoff = cutoff_rfc3339(60);

    let recent = match window_scores(conn, req, category.as_ref(), &recent_cutoff, None) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let previous = match window_scores(
        conn,
        req,
        category.as_ref(),
        &previous_cutoff,
        Some(&recent_cutoff),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mean_of = |scores: &[f64]| -> f64 {
        if scores.is_empty() {
            0.0
        } else {
            stats::round2(scores.iter().sum::<f64>() / scores.len() as f64)
        }
    };
    let recent_mean = mean_of(&recent);
    let previous_mean = mean_of(&previous);

    // An empty window contributes a zero mean, so activity drying up reads
    // as declining and fresh activity with no baseline reads as improving
    // (with the percentage zeroed by the baseline guard).
    let (direction, change_percentage) = stats::trend(previous_mean, recent_mean);

    ok(
        &req.id,
        json!({
            "direction": direction.as_str(),
            "changePercentage": change_percentage,
            "recent": { "days": 30, "mean": recent_mean, "responseCount": recent.len() },
            "previous": { "days": 30, "mean": previous_mean, "responseCount": previous.len() }
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "analytics.assessment" => Some(handle_analytics_assessment(state, req)),
        "analytics.student" => Some(handle_analytics_student(state, req)),
        "analytics.category" => Some(handle_analytics_category(state, req)),
        "analytics.trend" => Some(handle_analytics_trend(state, req)),
        _ => None,
    }
}
