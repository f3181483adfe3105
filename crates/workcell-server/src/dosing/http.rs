//! HTTP implementation of the DosingPlatform
//!
//! Speaks the dosing equipment's JSON-over-POST task API. Every call is a
//! POST under `/api/`, every reply carries a `code` field, and 200 is the
//! only code that means success.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

use workcell_core::domain::task::ExperimentDefinition;
use workcell_core::CoreError;

use super::{DosingPlatform, StartOptions, TaskSubmission};

/// The one reply code that means success
const CODE_OK: i64 = 200;

/// Request timeout for platform calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for the dosing platform's task API
#[derive(Debug, Clone)]
pub struct HttpDosingClient {
    /// Base URL of the platform, without a trailing slash
    base_url: String,

    /// HTTP client
    client: Client,
}

impl HttpDosingClient {
    /// Create a client against the given base URL
    pub fn new(base_url: impl Into<String>) -> Result<Self, CoreError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CoreError::ConfigurationError(format!("HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(HttpDosingClient { base_url, client })
    }

    /// URL of one API endpoint
    fn endpoint(&self, name: &str) -> String {
        format!("{}/api/{}", self.base_url, name)
    }

    /// POST one call and return the decoded reply after the code check.
    ///
    /// Transient connect failures get a single immediate retry; every
    /// other failure surfaces to the caller unchanged.
    async fn call(&self, name: &str, body: Value) -> Result<Value, CoreError> {
        let url = self.endpoint(name);
        debug!(%url, "dosing platform call");

        let response = match self.client.post(&url).json(&body).send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(CoreError::Timeout(format!("dosing platform {}", name)));
            }
            Err(err) if err.is_connect() => {
                warn!(%url, error = %err, "dosing platform connect failed, retrying once");
                self.client
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| CoreError::NotConnected(format!("dosing platform: {}", e)))?
            }
            Err(err) => {
                return Err(CoreError::NotConnected(format!("dosing platform: {}", err)));
            }
        };

        if !response.status().is_success() {
            return Err(CoreError::RemoteTaskError(
                response.status().as_u16() as i64
            ));
        }

        let reply: Value = response
            .json()
            .await
            .map_err(|e| CoreError::SerializationError(format!("dosing platform reply: {}", e)))?;
        let code = reply.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != CODE_OK {
            return Err(CoreError::RemoteTaskError(code));
        }
        Ok(reply)
    }
}

#[async_trait]
impl DosingPlatform for HttpDosingClient {
    async fn add_task(
        &self,
        remote_id: i64,
        definition: &ExperimentDefinition,
    ) -> Result<TaskSubmission, CoreError> {
        let mut body = json!({
            "task_id": remote_id,
            "task_name": definition.task_name,
            "layout_list": definition.layout,
        });
        if !definition.template_ids.is_empty() {
            body["task_template_id_list"] = json!(definition.template_ids);
        }

        let reply = self.call("AddTask", body).await?;
        let task_id = reply
            .get("task_id")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                CoreError::SerializationError("AddTask reply carried no task_id".to_string())
            })?;
        info!(task_name = %definition.task_name, remote_task_id = task_id, "task registered on dosing platform");

        Ok(TaskSubmission {
            task_id,
            workflow_id: reply.get("workflow_id").and_then(Value::as_i64),
            shortage: reply
                .get("shortage_list")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn start_task(&self, remote_id: i64, options: &StartOptions) -> Result<(), CoreError> {
        let mut body = json!({
            "task_id": remote_id,
            "skip_curr_taskunit": options.recovery.remote_code(),
            "run_by_single_tube": options.run_by_single_tube as i64,
            "quick_cap": options.quick_cap as i64,
        });
        // The platform treats an empty tip type as garbage; omit the
        // field entirely when there is nothing to say.
        if let Some(tip_type) = &options.use_tip_type {
            body["use_tip_type"] = json!(tip_type);
        }

        self.call("StartTask", body).await?;
        info!(
            remote_task_id = remote_id,
            recovery_code = options.recovery.remote_code(),
            "dosing task started"
        );
        Ok(())
    }

    async fn stop_task(&self, remote_id: i64) -> Result<(), CoreError> {
        self.call("StopTask", json!({ "task_id": remote_id })).await?;
        info!(remote_task_id = remote_id, "dosing task stopped");
        Ok(())
    }

    async fn cancel_task(&self, remote_id: i64) -> Result<(), CoreError> {
        self.call("CancelTask", json!({ "task_id": remote_id })).await?;
        info!(remote_task_id = remote_id, "dosing task cancelled");
        Ok(())
    }

    async fn task_info(&self, remote_id: Option<i64>) -> Result<Value, CoreError> {
        let body = match remote_id {
            Some(id) => json!({ "task_id": id }),
            None => json!({}),
        };
        self.call("GetTaskInfo", body).await
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        match self.task_info(None).await {
            Ok(_) => Ok(true),
            // An error code still proves the endpoint is answering.
            Err(CoreError::RemoteTaskError(_)) => Ok(true),
            Err(_) => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workcell_core::RecoveryMode;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn definition() -> ExperimentDefinition {
        ExperimentDefinition {
            task_name: "salt screen 12".to_string(),
            layout: vec![json!({"layout_code": "A1", "unit_row": 1})],
            template_ids: vec![],
            transfers: vec![],
        }
    }

    #[tokio::test]
    async fn test_add_task_parses_submission() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/AddTask"))
            .and(body_json(json!({
                "task_id": 0,
                "task_name": "salt screen 12",
                "layout_list": [{"layout_code": "A1", "unit_row": 1}],
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "task_id": 42,
                "workflow_id": 7,
                "shortage_list": [{"substance": "LiCl"}],
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let submission = client.add_task(0, &definition()).await.unwrap();
        assert_eq!(
            submission,
            TaskSubmission {
                task_id: 42,
                workflow_id: Some(7),
                shortage: vec![json!({"substance": "LiCl"})],
            }
        );
    }

    #[tokio::test]
    async fn test_template_ids_included_when_present() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/AddTask"))
            .and(body_json(json!({
                "task_id": 3,
                "task_name": "salt screen 12",
                "layout_list": [{"layout_code": "A1", "unit_row": 1}],
                "task_template_id_list": [11, 12],
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 200, "task_id": 3})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut definition = definition();
        definition.template_ids = vec![11, 12];
        let client = HttpDosingClient::new(server.uri()).unwrap();
        client.add_task(3, &definition).await.unwrap();
    }

    #[tokio::test]
    async fn test_error_code_surfaces_as_remote_task_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/AddTask"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"code": 409, "msg": "duplicate task name"})),
            )
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let err = client.add_task(0, &definition()).await.unwrap_err();
        assert_eq!(err, CoreError::RemoteTaskError(409));
    }

    #[tokio::test]
    async fn test_http_failure_surfaces_as_remote_task_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/StopTask"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let err = client.stop_task(9).await.unwrap_err();
        assert_eq!(err, CoreError::RemoteTaskError(500));
    }

    #[tokio::test]
    async fn test_start_task_sends_recovery_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/StartTask"))
            .and(body_json(json!({
                "task_id": 5,
                "skip_curr_taskunit": 4,
                "run_by_single_tube": 0,
                "quick_cap": 1,
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 200})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let options = StartOptions {
            recovery: RecoveryMode::SkipCurrentUnit,
            ..StartOptions::default()
        };
        client.start_task(5, &options).await.unwrap();
    }

    #[tokio::test]
    async fn test_tip_type_sent_only_when_set() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/StartTask"))
            .and(body_json(json!({
                "task_id": 5,
                "skip_curr_taskunit": 0,
                "run_by_single_tube": 1,
                "quick_cap": 1,
                "use_tip_type": "wide bore",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 200})))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let options = StartOptions {
            recovery: RecoveryMode::ResumeInPlace,
            run_by_single_tube: true,
            quick_cap: true,
            use_tip_type: Some("wide bore".to_string()),
        };
        client.start_task(5, &options).await.unwrap();
    }

    #[tokio::test]
    async fn test_task_info_for_current_task_sends_empty_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/GetTaskInfo"))
            .and(body_json(json!({})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "code": 200,
                "task_id": 17,
                "status": "running",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        let info = client.task_info(None).await.unwrap();
        assert_eq!(info["task_id"], 17);
    }

    #[tokio::test]
    async fn test_unreachable_platform_is_not_connected() {
        // Nothing listens on port 9 (discard) on loopback.
        let client = HttpDosingClient::new("http://127.0.0.1:9").unwrap();
        let err = client.task_info(None).await.unwrap_err();
        assert!(matches!(err, CoreError::NotConnected(_)), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_health_check_tolerates_platform_error_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/GetTaskInfo"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"code": 500, "msg": "no task"})),
            )
            .mount(&server)
            .await;

        let client = HttpDosingClient::new(server.uri()).unwrap();
        assert!(client.health_check().await.unwrap());

        let dead = HttpDosingClient::new("http://127.0.0.1:9").unwrap();
        assert!(!dead.health_check().await.unwrap());
    }
}
