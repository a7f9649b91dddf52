use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde_json::Value;

use crate::core::config::Settings;
use crate::core::security::SecretToken;

use super::classify::{from_errorcode, from_status, from_transport};
use super::{
    CallContext, DiscoveredAssignment, ExternalFailure, FileHandle, LmsGateway,
    RemoteSubmissionStatus, SiteUser, UploadFile,
};

const UPLOAD_PATH: &str = "/webservice/upload.php";
const REST_PATH: &str = "/webservice/rest/server.php";

/// Moodle web-service client. Holds no student credentials; each call takes a [`CallContext`].
#[derive(Debug, Clone)]
pub(crate) struct MoodleClient {
    client: Client,
    base_url: String,
}

impl MoodleClient {
    pub(crate) fn from_settings(settings: &Settings) -> Result<Self> {
        let lms = settings.lms();
        Self::new(
            &lms.base_url,
            Duration::from_secs(lms.connect_timeout_seconds),
            Duration::from_secs(lms.request_timeout_seconds),
        )
    }

    pub(crate) fn new(base_url: &str, connect_timeout: Duration, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(timeout)
            .build()
            .context("Failed to build Moodle HTTP client")?;

        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string() })
    }

    async fn call(
        &self,
        token: &SecretToken,
        function: &'static str,
        params: &[(&str, String)],
    ) -> Result<Value, ExternalFailure> {
        let mut form: Vec<(&str, String)> = vec![
            ("wstoken", token.expose().to_string()),
            ("wsfunction", function.to_string()),
            ("moodlewsrestformat", "json".to_string()),
        ];
        form.extend(params.iter().cloned());

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(format!("{}{}", self.base_url, REST_PATH))
            .form(&form)
            .send()
            .await
            .map_err(|err| log_failure(function, from_transport(&err)))?;

        let result = read_json(response).await.map_err(|failure| log_failure(function, failure));
        tracing::debug!(
            function,
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "Moodle call finished"
        );
        result
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, ExternalFailure> {
    let status = response.status();
    if let Some(failure) = from_status(status) {
        return Err(failure);
    }

    let raw_body = response.text().await.map_err(|err| from_transport(&err))?;
    let parsed = serde_json::from_str::<Value>(&raw_body)
        .map_err(|_| ExternalFailure::transient("invalid_response"))?;

    if let Some(errorcode) = moodle_errorcode(&parsed) {
        return Err(from_errorcode(&errorcode));
    }

    Ok(parsed)
}

/// Moodle reports failures inside 200 responses as `{exception, errorcode, message}` or, for
/// uploads, `{error, errorcode}`.
fn moodle_errorcode(value: &Value) -> Option<String> {
    let object = value.as_object()?;
    if !object.contains_key("exception") && !object.contains_key("errorcode") && !object.contains_key("error") {
        return None;
    }
    Some(
        object
            .get("errorcode")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    )
}

fn log_failure(function: &'static str, failure: ExternalFailure) -> ExternalFailure {
    tracing::warn!(
        function,
        kind = failure.kind.as_str(),
        reason = %failure.reason,
        "Moodle call failed"
    );
    failure
}

/// Moodle serialises ids as numbers on most endpoints and as strings on a few.
fn as_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn warnings_to_failure(value: &Value, reason_prefix: &str) -> Result<(), ExternalFailure> {
    let warnings = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(object) => {
            object.get("warnings").and_then(Value::as_array).map(Vec::as_slice).unwrap_or_default()
        }
        _ => &[],
    };

    match warnings.first() {
        None => Ok(()),
        Some(warning) => {
            let code = warning.get("warningcode").and_then(Value::as_str).unwrap_or("unknown");
            Err(ExternalFailure::permanent(format!("{reason_prefix}:{code}")))
        }
    }
}

#[async_trait]
impl LmsGateway for MoodleClient {
    async fn upload(
        &self,
        ctx: &CallContext,
        file: &UploadFile,
    ) -> Result<FileHandle, ExternalFailure> {
        let token = ctx.student_token()?;

        let part = Part::bytes(file.bytes.clone())
            .file_name(file.filename.clone())
            .mime_str(&file.mime_type)
            .map_err(|_| ExternalFailure::permanent("invalid_mime_type"))?;
        let form = Form::new()
            .text("token", token.expose().to_string())
            .text("filearea", "draft")
            .text("itemid", "0")
            .part("file_1", part);

        let response = self
            .client
            .post(format!("{}{}", self.base_url, UPLOAD_PATH))
            .multipart(form)
            .send()
            .await
            .map_err(|err| log_failure("upload", from_transport(&err)))?;

        let parsed = read_json(response).await.map_err(|failure| log_failure("upload", failure))?;
        let item_id = parsed
            .as_array()
            .and_then(|items| items.first())
            .and_then(|item| as_id(item.get("itemid")))
            .ok_or_else(|| log_failure("upload", ExternalFailure::transient("missing_itemid")))?;

        tracing::info!(item_id, size_bytes = file.bytes.len(), "Uploaded file to Moodle draft area");
        Ok(FileHandle(item_id))
    }

    async fn save_draft(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
        handle: FileHandle,
    ) -> Result<(), ExternalFailure> {
        let token = ctx.student_token()?;
        let value = self
            .call(
                token,
                "mod_assign_save_submission",
                &[
                    ("assignmentid", assignment_id.to_string()),
                    ("plugindata[files_filemanager]", handle.0.to_string()),
                ],
            )
            .await?;
        warnings_to_failure(&value, "save_warning")
    }

    async fn submit_for_grading(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
    ) -> Result<(), ExternalFailure> {
        let token = ctx.student_token()?;
        let value = self
            .call(
                token,
                "mod_assign_submit_for_grading",
                &[
                    ("assignmentid", assignment_id.to_string()),
                    ("acceptsubmissionstatement", "1".to_string()),
                ],
            )
            .await?;
        warnings_to_failure(&value, "submit_warning")
    }

    async fn handle_is_valid(
        &self,
        ctx: &CallContext,
        handle: FileHandle,
    ) -> Result<bool, ExternalFailure> {
        let user = self.site_user(ctx).await?;
        let token = ctx.student_token()?;
        let value = self
            .call(
                token,
                "core_files_get_files",
                &[
                    ("contextid", "-1".to_string()),
                    ("component", "user".to_string()),
                    ("filearea", "draft".to_string()),
                    ("itemid", handle.0.to_string()),
                    ("filepath", "/".to_string()),
                    ("filename", String::new()),
                    ("contextlevel", "user".to_string()),
                    ("instanceid", user.user_id.to_string()),
                ],
            )
            .await?;

        Ok(value.get("files").and_then(Value::as_array).is_some_and(|files| !files.is_empty()))
    }

    async fn submission_status(
        &self,
        ctx: &CallContext,
        assignment_id: i64,
    ) -> Result<RemoteSubmissionStatus, ExternalFailure> {
        let token = ctx.student_token()?;
        let value = self
            .call(token, "mod_assign_get_submission_status", &[("assignid", assignment_id.to_string())])
            .await?;

        let status = value
            .pointer("/lastattempt/submission/status")
            .or_else(|| value.pointer("/lastattempt/teamsubmission/status"))
            .and_then(Value::as_str);

        Ok(status.map(RemoteSubmissionStatus::parse).unwrap_or(RemoteSubmissionStatus::New))
    }

    async fn site_user(&self, ctx: &CallContext) -> Result<SiteUser, ExternalFailure> {
        let token = ctx.student_token()?;
        let value = self.call(token, "core_webservice_get_site_info", &[]).await?;

        let user_id = as_id(value.get("userid"))
            .ok_or_else(|| ExternalFailure::transient("missing_userid"))?;
        let username = value
            .get("username")
            .and_then(Value::as_str)
            .ok_or_else(|| ExternalFailure::transient("missing_username"))?
            .to_string();

        Ok(SiteUser { user_id, username })
    }

    async fn list_assignments(
        &self,
        ctx: &CallContext,
    ) -> Result<Vec<DiscoveredAssignment>, ExternalFailure> {
        let token = ctx.service_token()?;
        let value = self.call(token, "mod_assign_get_assignments", &[]).await?;

        let courses = value.get("courses").and_then(Value::as_array).cloned().unwrap_or_default();
        let mut assignments = Vec::new();
        for course in &courses {
            let Some(course_id) = as_id(course.get("id")) else {
                continue;
            };
            let shortname =
                course.get("shortname").and_then(Value::as_str).unwrap_or_default().to_string();

            for assignment in course.get("assignments").and_then(Value::as_array).into_iter().flatten() {
                let Some(assignment_id) = as_id(assignment.get("id")) else {
                    continue;
                };
                assignments.push(DiscoveredAssignment {
                    course_id,
                    course_shortname: shortname.clone(),
                    assignment_id,
                    name: assignment
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                });
            }
        }

        Ok(assignments)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use axum::extract::Form as AxumForm;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    use super::*;
    use crate::db::types::FailureKind;

    async fn rest(AxumForm(params): AxumForm<HashMap<String, String>>) -> Json<Value> {
        if params.get("wstoken").map(String::as_str) == Some("expired") {
            return Json(json!({
                "exception": "moodle_exception",
                "errorcode": "invalidtoken",
                "message": "Invalid token - token expired"
            }));
        }

        let body = match params.get("wsfunction").map(String::as_str) {
            Some("core_webservice_get_site_info") => {
                json!({ "userid": 42, "username": "611221104088", "sitename": "Exams" })
            }
            Some("mod_assign_save_submission") => {
                if params.get("assignmentid").map(String::as_str) == Some("13") {
                    json!([{ "item": "assignment", "warningcode": "couldnotsavesubmission" }])
                } else {
                    json!([])
                }
            }
            Some("mod_assign_submit_for_grading") => json!([]),
            Some("mod_assign_get_submission_status") => {
                json!({ "lastattempt": { "submission": { "status": "submitted" } } })
            }
            Some("core_files_get_files") => {
                if params.get("itemid").map(String::as_str) == Some("555") {
                    json!({ "parents": [], "files": [{ "filename": "a.pdf" }] })
                } else {
                    json!({ "parents": [], "files": [] })
                }
            }
            Some("mod_assign_get_assignments") => json!({
                "courses": [{
                    "id": 7,
                    "shortname": "19AI405",
                    "assignments": [{ "id": 31, "name": "End semester answer sheet" }]
                }],
                "warnings": []
            }),
            _ => json!({ "exception": "webservice_access_exception", "errorcode": "accessexception" }),
        };
        Json(body)
    }

    async fn upload() -> Json<Value> {
        Json(json!([{ "component": "user", "filearea": "draft", "itemid": 555, "filename": "a.pdf" }]))
    }

    async fn spawn_fake(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn client() -> MoodleClient {
        let base = spawn_fake(
            Router::new().route(REST_PATH, post(rest)).route(UPLOAD_PATH, post(upload)),
        )
        .await;
        MoodleClient::new(&base, Duration::from_secs(2), Duration::from_secs(5)).expect("client")
    }

    fn student() -> CallContext {
        CallContext::student(SecretToken::new("student-token"))
    }

    fn pdf() -> UploadFile {
        UploadFile {
            filename: "611221104088_19AI405.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: b"%PDF-1.4".to_vec(),
        }
    }

    #[tokio::test]
    async fn runs_the_three_step_protocol() {
        let client = client().await;
        let ctx = student();

        let handle = client.upload(&ctx, &pdf()).await.expect("upload");
        assert_eq!(handle, FileHandle(555));
        client.save_draft(&ctx, 31, handle).await.expect("save");
        client.submit_for_grading(&ctx, 31).await.expect("submit");
        assert_eq!(
            client.submission_status(&ctx, 31).await.expect("status"),
            RemoteSubmissionStatus::Submitted
        );
    }

    #[tokio::test]
    async fn save_warnings_are_permanent() {
        let client = client().await;
        let err = client.save_draft(&student(), 13, FileHandle(555)).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.reason, "save_warning:couldnotsavesubmission");
    }

    #[tokio::test]
    async fn invalid_token_is_permanent_and_not_echoed() {
        let client = client().await;
        let ctx = CallContext::student(SecretToken::new("expired"));
        let err = client.site_user(&ctx).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::Permanent);
        assert_eq!(err.reason, "invalidtoken");
        assert!(!err.to_string().contains("expired"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_before_any_request() {
        let client =
            MoodleClient::new("http://127.0.0.1:9", Duration::from_secs(1), Duration::from_secs(1))
                .expect("client");
        let err = client.upload(&CallContext::default(), &pdf()).await.unwrap_err();
        assert_eq!(err, ExternalFailure::permanent("missing_student_token"));
        let err = client.list_assignments(&student()).await.unwrap_err();
        assert_eq!(err, ExternalFailure::permanent("missing_service_token"));
    }

    #[tokio::test]
    async fn probes_draft_handles() {
        let client = client().await;
        assert!(client.handle_is_valid(&student(), FileHandle(555)).await.expect("probe"));
        assert!(!client.handle_is_valid(&student(), FileHandle(9)).await.expect("probe"));
    }

    #[tokio::test]
    async fn lists_assignments_with_the_service_token() {
        let client = client().await;
        let ctx = CallContext::service(SecretToken::new("service-token"));
        let assignments = client.list_assignments(&ctx).await.expect("assignments");
        assert_eq!(
            assignments,
            vec![DiscoveredAssignment {
                course_id: 7,
                course_shortname: "19AI405".to_string(),
                assignment_id: 31,
                name: "End semester answer sheet".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn server_errors_and_timeouts_are_transient() {
        let base = spawn_fake(
            Router::new()
                .route(REST_PATH, post(|| async { StatusCode::SERVICE_UNAVAILABLE }))
                .route(
                    UPLOAD_PATH,
                    post(|| async {
                        tokio::time::sleep(Duration::from_secs(2)).await;
                        Json(json!([]))
                    }),
                ),
        )
        .await;
        let client = MoodleClient::new(&base, Duration::from_secs(1), Duration::from_millis(200))
            .expect("client");

        let err = client.submit_for_grading(&student(), 31).await.unwrap_err();
        assert_eq!(err, ExternalFailure::transient("http_503"));

        let err = client.upload(&student(), &pdf()).await.unwrap_err();
        assert_eq!(err, ExternalFailure::transient("timeout"));
    }
}
