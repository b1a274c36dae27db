use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_mindwelld");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn mindwelld");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn result(value: &serde_json::Value) -> &serde_json::Value {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "expected ok response, got {}",
        value
    );
    value.get("result").expect("result present")
}

fn error_code(value: &serde_json::Value) -> &str {
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(false),
        "expected error response, got {}",
        value
    );
    value["error"]["code"].as_str().expect("error code")
}

fn setup_template(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    prefix: &str,
) -> (PathBuf, String) {
    let workspace = temp_dir(prefix);
    result(&request(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    ));
    let template = request(
        stdin,
        reader,
        "tpl",
        "templates.create",
        json!({
            "name": "One Item",
            "createdBy": "counselor-1",
            "questions": [{
                "question_id": "q1",
                "question_text": "Single item",
                "question_type": "rating_scale",
                "required": true,
                "min": 1.0,
                "max": 5.0
            }]
        }),
    );
    let template_id = result(&template)["templateId"]
        .as_str()
        .expect("templateId")
        .to_string();
    (workspace, template_id)
}

#[test]
fn create_requires_a_target_and_a_known_template() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, template_id) =
        setup_template(&mut stdin, &mut reader, "mindwell-assessments-create");

    let no_target = request(
        &mut stdin,
        &mut reader,
        "1",
        "assessments.create",
        json!({ "templateId": template_id, "title": "Nowhere", "createdBy": "c" }),
    );
    assert_eq!(error_code(&no_target), "validation_error");

    let ghost_template = request(
        &mut stdin,
        &mut reader,
        "2",
        "assessments.create",
        json!({
            "templateId": "no-such-template",
            "schoolId": "school-1",
            "title": "Orphaned",
            "createdBy": "c"
        }),
    );
    assert_eq!(error_code(&ghost_template), "not_found");

    let ghost_class = request(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "templateId": template_id,
            "classId": "no-such-class",
            "title": "Orphaned",
            "createdBy": "c"
        }),
    );
    assert_eq!(error_code(&ghost_class), "not_found");

    let school_wide = request(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({
            "templateId": template_id,
            "schoolId": "school-1",
            "title": "School pulse",
            "createdBy": "principal-1"
        }),
    );
    assert!(result(&school_wide)["assessmentId"].is_string());

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn exclusion_set_is_idempotent_and_reversible() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (workspace, template_id) = setup_template(&mut stdin, &mut reader, "mindwell-exclusions");

    let class = request(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({ "name": "4A" }),
    );
    let class_id = result(&class)["classId"].as_str().expect("classId").to_string();
    let student = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.create",
        json!({ "classId": class_id, "firstName": "Otto", "lastName": "Berg" }),
    );
    let student_id = result(&student)["studentId"]
        .as_str()
        .expect("studentId")
        .to_string();

    let assessment = request(
        &mut stdin,
        &mut reader,
        "3",
        "assessments.create",
        json!({
            "templateId": template_id,
            "classId": class_id,
            "title": "Exclusion check",
            "createdBy": "counselor-1"
        }),
    );
    let assessment_id = result(&assessment)["assessmentId"]
        .as_str()
        .expect("assessmentId")
        .to_string();

    let excluded = request(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.exclusions.set",
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "excluded": true,
            "actor": "counselor-1"
        }),
    );
    assert_eq!(
        result(&excluded)["excludedStudents"],
        json!([student_id.clone()])
    );

    // Setting the same state again must not duplicate the entry.
    let again = request(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.exclusions.set",
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "excluded": true
        }),
    );
    assert_eq!(
        result(&again)["excludedStudents"],
        json!([student_id.clone()])
    );

    let fetched = request(
        &mut stdin,
        &mut reader,
        "6",
        "assessments.get",
        json!({ "assessmentId": assessment_id }),
    );
    assert_eq!(
        result(&fetched)["excludedStudents"],
        json!([student_id.clone()])
    );

    let restored = request(
        &mut stdin,
        &mut reader,
        "7",
        "assessments.exclusions.set",
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "excluded": false,
            "actor": "counselor-1"
        }),
    );
    assert_eq!(result(&restored)["excludedStudents"], json!([]));

    let ghost = request(
        &mut stdin,
        &mut reader,
        "8",
        "assessments.exclusions.set",
        json!({
            "assessmentId": "no-such-assessment",
            "studentId": student_id,
            "excluded": true
        }),
    );
    assert_eq!(error_code(&ghost), "not_found");

    // Every toggle, including the no-op repeat, lands in the audit table.
    let conn = rusqlite::Connection::open(workspace.join("mindwell.sqlite3"))
        .expect("open workspace db");
    let mut stmt = conn
        .prepare(
            "SELECT action, actor, at FROM exclusion_events
             WHERE assessment_id = ? ORDER BY rowid",
        )
        .expect("prepare audit query");
    let events: Vec<(String, Option<String>, String)> = stmt
        .query_map([&assessment_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .expect("query audit rows")
        .collect::<Result<_, _>>()
        .expect("collect audit rows");

    assert_eq!(events.len(), 3);
    assert_eq!(events[0].0, "exclude");
    assert_eq!(events[0].1.as_deref(), Some("counselor-1"));
    assert_eq!(events[1].0, "exclude");
    assert_eq!(events[1].1, None);
    assert_eq!(events[2].0, "include");
    assert_eq!(events[2].1.as_deref(), Some("counselor-1"));
    assert!(events.iter().all(|(_, _, at)| !at.is_empty()));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn list_filters_by_class_and_template() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_workspace, template_id) =
        setup_template(&mut stdin, &mut reader, "mindwell-assessments-list");

    let class_a = request(
        &mut stdin,
        &mut reader,
        "1",
        "classes.create",
        json!({ "name": "A" }),
    );
    let class_a_id = result(&class_a)["classId"].as_str().expect("classId").to_string();
    let class_b = request(
        &mut stdin,
        &mut reader,
        "2",
        "classes.create",
        json!({ "name": "B" }),
    );
    let class_b_id = result(&class_b)["classId"].as_str().expect("classId").to_string();

    for (i, class_id) in [&class_a_id, &class_a_id, &class_b_id].iter().enumerate() {
        result(&request(
            &mut stdin,
            &mut reader,
            &format!("c{}", i),
            "assessments.create",
            json!({
                "templateId": template_id,
                "classId": class_id,
                "title": format!("Run {}", i),
                "createdBy": "counselor-1"
            }),
        ));
    }

    let all = request(&mut stdin, &mut reader, "3", "assessments.list", json!({}));
    assert_eq!(result(&all)["assessments"].as_array().map(|a| a.len()), Some(3));

    let only_a = request(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.list",
        json!({ "classId": class_a_id }),
    );
    assert_eq!(
        result(&only_a)["assessments"].as_array().map(|a| a.len()),
        Some(2)
    );

    let by_template = request(
        &mut stdin,
        &mut reader,
        "5",
        "assessments.list",
        json!({ "templateId": template_id, "classId": class_b_id }),
    );
    let rows = result(&by_template)["assessments"].as_array().expect("assessments");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["templateName"], json!("One Item"));

    drop(stdin);
    let _ = child.wait();
}
