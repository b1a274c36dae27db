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

fn select_workspace(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>, prefix: &str) {
    let workspace = temp_dir(prefix);
    result(&request(
        stdin,
        reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    ));
}

fn rating_question(id: &str, text: &str) -> serde_json::Value {
    json!({
        "question_id": id,
        "question_text": text,
        "question_type": "rating_scale",
        "required": true,
        "min": 1.0,
        "max": 5.0
    })
}

#[test]
fn create_rejects_malformed_definitions_up_front() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "mindwell-templates-validate");

    let blank_name = request(
        &mut stdin,
        &mut reader,
        "1",
        "templates.create",
        json!({
            "name": "   ",
            "createdBy": "counselor-1",
            "questions": [rating_question("q1", "fine")]
        }),
    );
    assert_eq!(error_code(&blank_name), "validation_error");

    let no_questions = request(
        &mut stdin,
        &mut reader,
        "2",
        "templates.create",
        json!({ "name": "Empty", "createdBy": "counselor-1", "questions": [] }),
    );
    assert_eq!(error_code(&no_questions), "validation_error");

    let unknown_type = request(
        &mut stdin,
        &mut reader,
        "3",
        "templates.create",
        json!({
            "name": "Odd",
            "createdBy": "counselor-1",
            "questions": [{
                "question_id": "q1",
                "question_text": "??",
                "question_type": "slider_matrix"
            }]
        }),
    );
    assert_eq!(error_code(&unknown_type), "validation_error");

    let duplicate_ids = request(
        &mut stdin,
        &mut reader,
        "4",
        "templates.create",
        json!({
            "name": "Doubled",
            "createdBy": "counselor-1",
            "questions": [
                rating_question("q1", "first"),
                rating_question("q1", "second")
            ]
        }),
    );
    assert_eq!(error_code(&duplicate_ids), "validation_error");

    let inverted_range = request(
        &mut stdin,
        &mut reader,
        "5",
        "templates.create",
        json!({
            "name": "Backwards",
            "createdBy": "counselor-1",
            "questions": [{
                "question_id": "q1",
                "question_text": "upside down",
                "question_type": "rating_scale",
                "min": 5.0,
                "max": 1.0
            }]
        }),
    );
    assert_eq!(error_code(&inverted_range), "validation_error");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn update_replaces_only_the_provided_fields() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "mindwell-templates-update");

    let created = request(
        &mut stdin,
        &mut reader,
        "1",
        "templates.create",
        json!({
            "name": "Check-In v1",
            "description": "weekly",
            "category": "wellbeing",
            "createdBy": "counselor-1",
            "questions": [rating_question("q1", "mood")]
        }),
    );
    let template_id = result(&created)["templateId"]
        .as_str()
        .expect("templateId")
        .to_string();

    let updated = request(
        &mut stdin,
        &mut reader,
        "2",
        "templates.update",
        json!({ "templateId": template_id, "name": "Check-In v2" }),
    );
    assert!(result(&updated)["updatedAt"].is_string());

    let fetched = request(
        &mut stdin,
        &mut reader,
        "3",
        "templates.get",
        json!({ "templateId": template_id }),
    );
    let t = result(&fetched);
    assert_eq!(t["name"], json!("Check-In v2"));
    assert_eq!(t["description"], json!("weekly"));
    assert_eq!(t["category"], json!("wellbeing"));
    assert_eq!(t["questions"].as_array().map(|a| a.len()), Some(1));
    assert!(t["updatedAt"].is_string());

    let bad_questions = request(
        &mut stdin,
        &mut reader,
        "4",
        "templates.update",
        json!({ "templateId": template_id, "questions": [] }),
    );
    assert_eq!(error_code(&bad_questions), "validation_error");

    let missing = request(
        &mut stdin,
        &mut reader,
        "5",
        "templates.update",
        json!({ "templateId": "no-such-template", "name": "x" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn deactivate_hides_from_default_listing_but_keeps_the_row() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    select_workspace(&mut stdin, &mut reader, "mindwell-templates-deactivate");

    let keep = request(
        &mut stdin,
        &mut reader,
        "1",
        "templates.create",
        json!({
            "name": "Active One",
            "category": "mood",
            "createdBy": "counselor-1",
            "questions": [rating_question("q1", "mood")]
        }),
    );
    let keep_id = result(&keep)["templateId"].as_str().expect("id").to_string();

    let retire = request(
        &mut stdin,
        &mut reader,
        "2",
        "templates.create",
        json!({
            "name": "Retired One",
            "category": "stress",
            "createdBy": "counselor-1",
            "questions": [rating_question("q1", "stress")]
        }),
    );
    let retire_id = result(&retire)["templateId"].as_str().expect("id").to_string();

    let deactivated = request(
        &mut stdin,
        &mut reader,
        "3",
        "templates.deactivate",
        json!({ "templateId": retire_id }),
    );
    assert_eq!(result(&deactivated)["active"], json!(false));

    let default_list = request(&mut stdin, &mut reader, "4", "templates.list", json!({}));
    let names: Vec<&str> = result(&default_list)["templates"]
        .as_array()
        .expect("templates")
        .iter()
        .filter_map(|t| t["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Active One"]);

    let full_list = request(
        &mut stdin,
        &mut reader,
        "5",
        "templates.list",
        json!({ "includeInactive": true }),
    );
    assert_eq!(
        result(&full_list)["templates"].as_array().map(|a| a.len()),
        Some(2)
    );

    let by_category = request(
        &mut stdin,
        &mut reader,
        "6",
        "templates.list",
        json!({ "category": "mood" }),
    );
    let filtered = result(&by_category)["templates"].as_array().expect("templates");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0]["templateId"].as_str(), Some(keep_id.as_str()));

    // The row survives for history even though listings hide it.
    let fetched = request(
        &mut stdin,
        &mut reader,
        "7",
        "templates.get",
        json!({ "templateId": retire_id }),
    );
    assert_eq!(result(&fetched)["active"], json!(false));

    let missing = request(
        &mut stdin,
        &mut reader,
        "8",
        "templates.deactivate",
        json!({ "templateId": "no-such-template" }),
    );
    assert_eq!(error_code(&missing), "not_found");

    drop(stdin);
    let _ = child.wait();
}
