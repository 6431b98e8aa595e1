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
    let exe = env!("CARGO_BIN_EXE_reportcardd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn reportcardd");
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
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn request_err(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        !value.get("ok").and_then(|v| v.as_bool()).unwrap_or(true),
        "{} unexpectedly succeeded: {}",
        method,
        value
    );
    value.get("error").cloned().unwrap_or_else(|| json!({}))
}

fn result_str(result: &serde_json::Value, key: &str) -> String {
    result
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, result))
        .to_string()
}

struct School {
    teacher_id: String,
    admin_id: String,
    class_id: String,
    student_ids: Vec<String>,
    subject_ids: Vec<String>,
}

fn seed_school(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> School {
    let workspace = temp_dir("reportcard-batch");
    request_ok(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        stdin,
        reader,
        "s2",
        "profiles.create",
        json!({ "fullName": "Grace Nakato", "role": "teacher" }),
    );
    let admin = request_ok(
        stdin,
        reader,
        "s3",
        "profiles.create",
        json!({ "fullName": "Head Teacher", "role": "admin" }),
    );
    let class = request_ok(
        stdin,
        reader,
        "s4",
        "classes.create",
        json!({ "name": "P7 East" }),
    );
    let class_id = result_str(&class, "classId");

    let mut student_ids = Vec::new();
    for (i, (last, first)) in [("Apio", "Sarah"), ("Ouma", "David"), ("Namono", "Ruth")]
        .iter()
        .enumerate()
    {
        let student = request_ok(
            stdin,
            reader,
            &format!("s5-{}", i),
            "students.create",
            json!({ "classId": class_id, "lastName": last, "firstName": first }),
        );
        student_ids.push(result_str(&student, "studentId"));
    }

    let mut subject_ids = Vec::new();
    for (i, name) in ["Mathematics", "Science", "English"].iter().enumerate() {
        let subject = request_ok(
            stdin,
            reader,
            &format!("s6-{}", i),
            "subjects.create",
            json!({ "classId": class_id, "name": name }),
        );
        subject_ids.push(result_str(&subject, "subjectId"));
    }

    let admin_id = result_str(&admin, "profileId");
    request_ok(
        stdin,
        reader,
        "s7",
        "session.signIn",
        json!({ "profileId": admin_id }),
    );
    for (i, (grade, min, max)) in [
        ("A", 80.0, 100.0),
        ("B", 70.0, 79.99),
        ("C", 60.0, 69.99),
        ("D", 40.0, 59.99),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            stdin,
            reader,
            &format!("s8-{}", i),
            "gradeBoundaries.upsert",
            json!({ "grade": grade, "minScore": min, "maxScore": max }),
        );
    }
    for (i, (min, max, ct, ht)) in [
        (0, 59, "Work harder next term", "Aim higher"),
        (60, 79, "Good progress", "Keep improving"),
        (80, 100, "Excellent work", "Outstanding term"),
    ]
    .iter()
    .enumerate()
    {
        request_ok(
            stdin,
            reader,
            &format!("s9-{}", i),
            "commentTemplates.upsert",
            json!({
                "minPercentage": min,
                "maxPercentage": max,
                "classTeacherComment": ct,
                "headteacherComment": ht
            }),
        );
    }

    School {
        teacher_id: result_str(&teacher, "profileId"),
        admin_id,
        class_id,
        student_ids,
        subject_ids,
    }
}

fn submit_subject(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    school: &School,
    student_id: &str,
    subject_id: &str,
    p100: i64,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "submissions.submit",
        json!({
            "classId": school.class_id,
            "studentId": student_id,
            "subjectId": subject_id,
            "a1Score": 72.5,
            "a2Score": 68.0,
            "a3Score": 81.5,
            "percentage20": 15,
            "percentage80": p100 - 15,
            "percentage100": p100
        }),
    );
    result_str(&result, "submissionId")
}

#[test]
fn only_approved_submissions_feed_the_overall_average() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader);
    let student_id = school.student_ids[0].clone();

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "session.signIn",
        json!({ "profileId": school.teacher_id }),
    );
    let approved_a =
        submit_subject(&mut stdin, &mut reader, "2", &school, &student_id, &school.subject_ids[0], 85);
    let approved_b =
        submit_subject(&mut stdin, &mut reader, "3", &school, &student_id, &school.subject_ids[1], 60);
    // Third subject stays pending and must not count.
    submit_subject(&mut stdin, &mut reader, "4", &school, &student_id, &school.subject_ids[2], 100);

    request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "session.signIn",
        json!({ "profileId": school.admin_id }),
    );
    for (i, submission_id) in [&approved_a, &approved_b].iter().enumerate() {
        request_ok(
            &mut stdin,
            &mut reader,
            &format!("6-{}", i),
            "submissions.review",
            json!({ "submissionId": submission_id, "action": "approve" }),
        );
    }

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "reports.generate",
        json!({
            "classId": school.class_id,
            "studentIds": [student_id],
            "generationType": "individual"
        }),
    );
    let results = generated
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");
    assert_eq!(results.len(), 1);
    assert_eq!(
        results[0].get("overallAverage").and_then(|v| v.as_f64()),
        Some(72.5),
        "mean of the two approved subjects only"
    );
    assert_eq!(
        results[0].get("overallGrade").and_then(|v| v.as_str()),
        Some("B")
    );

    let card = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "reports.get",
        json!({ "classId": school.class_id, "studentId": student_id }),
    );
    let report_card = card.get("reportCard").expect("reportCard");
    assert_eq!(
        report_card
            .get("classTeacherComment")
            .and_then(|v| v.as_str()),
        Some("Good progress")
    );
    assert_eq!(
        report_card
            .get("headteacherComment")
            .and_then(|v| v.as_str()),
        Some("Keep improving")
    );
    // Only the two approved subjects appear on the printed card.
    let subjects = card.get("subjects").and_then(|v| v.as_array()).expect("subjects");
    assert_eq!(subjects.len(), 2);
    let idents: Vec<i64> = subjects
        .iter()
        .filter_map(|s| s.get("identifier").and_then(|v| v.as_i64()))
        .collect();
    // 85 -> 3, 60 -> 1 under the identifier banding.
    assert_eq!(idents.iter().sum::<i64>(), 4);
}

#[test]
fn batch_isolates_per_student_failures() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader);

    request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "session.signIn",
        json!({ "profileId": school.teacher_id }),
    );
    let first_student = school.student_ids[0].clone();
    let first_subject = school.subject_ids[0].clone();
    let submission_id = submit_subject(
        &mut stdin,
        &mut reader,
        "2",
        &school,
        &first_student,
        &first_subject,
        85,
    );

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.signIn",
        json!({ "profileId": school.admin_id }),
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "submissions.review",
        json!({ "submissionId": submission_id, "action": "approve" }),
    );

    let generated = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "reports.generate",
        json!({
            "classId": school.class_id,
            "studentIds": [
                school.student_ids[0],
                "no-such-student",
                school.student_ids[2]
            ]
        }),
    );
    assert_eq!(generated.get("success").and_then(|v| v.as_bool()), Some(true));
    let results = generated
        .get("results")
        .and_then(|v| v.as_array())
        .expect("results array");
    assert_eq!(results.len(), 3);

    assert_eq!(results[0].get("success").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        results[0].get("overallAverage").and_then(|v| v.as_f64()),
        Some(85.0)
    );

    assert_eq!(results[1].get("success").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        results[1]
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|c| c.as_str()),
        Some("not_found")
    );

    // Zero approved submissions is a valid card: average 0, fallback grade.
    assert_eq!(results[2].get("success").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(
        results[2].get("overallAverage").and_then(|v| v.as_f64()),
        Some(0.0)
    );
    assert_eq!(
        results[2].get("overallGrade").and_then(|v| v.as_str()),
        Some("F")
    );
}

#[test]
fn generation_requires_identity_and_well_formed_params() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let school = seed_school(&mut stdin, &mut reader);

    request_ok(&mut stdin, &mut reader, "1", "session.signOut", json!({}));
    let error = request_err(
        &mut stdin,
        &mut reader,
        "2",
        "reports.generate",
        json!({ "classId": school.class_id, "studentIds": [school.student_ids[0]] }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("unauthorized"));

    request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "session.signIn",
        json!({ "profileId": school.admin_id }),
    );
    let error = request_err(
        &mut stdin,
        &mut reader,
        "4",
        "reports.generate",
        json!({ "classId": school.class_id }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "5",
        "reports.generate",
        json!({ "classId": school.class_id, "studentIds": [] }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "6",
        "reports.generate",
        json!({
            "classId": "no-such-class",
            "studentIds": [school.student_ids[0]]
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("not_found"));

    let error = request_err(
        &mut stdin,
        &mut reader,
        "7",
        "reports.generate",
        json!({
            "classId": school.class_id,
            "studentIds": [school.student_ids[0]],
            "generationType": "galaxy"
        }),
    );
    assert_eq!(error.get("code").and_then(|v| v.as_str()), Some("bad_params"));
}
