use crate::domain::models::{NewOperation, OperationMethod, TargetPath, TimedInterval};
use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use std::time::Duration;
use tracing::warn;
use url::Url;

pub const ACCESS_TOKEN_HEADER: &str = "x-access-token";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteResponse {
    Interval(TimedInterval),
    Deleted,
    /// A 2xx create whose body did not name the created record.
    Unidentified,
}

/// Performs exactly one mutation against the remote API.
///
/// Implementations never retry; retry policy belongs to the scheduler.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, operation: &NewOperation) -> Result<RemoteResponse, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestRemoteExecutor {
    client: Client,
    base_url: Url,
    access_token: String,
}

impl ReqwestRemoteExecutor {
    pub fn new(
        base_url: Url,
        access_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, InfraError> {
        let access_token = access_token.into();
        if access_token.trim().is_empty() {
            return Err(InfraError::InvalidConfig("access token must not be empty".to_string()));
        }
        if base_url.cannot_be_a_base() {
            return Err(InfraError::InvalidConfig(format!(
                "api base URL cannot be a base: {base_url}"
            )));
        }
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| InfraError::InvalidConfig(format!("failed to build http client: {error}")))?;

        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }

    fn endpoint(&self, target: &TargetPath) -> Result<Url, InfraError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::InvalidConfig("api base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("tasks");
            segments.push(&target.task_id);
            segments.push("times");
            if let Some(interval_id) = target.interval_id.as_deref() {
                segments.push(interval_id);
            }
        }
        Ok(url)
    }

    fn http_method(method: OperationMethod) -> Method {
        match method {
            OperationMethod::Create => Method::POST,
            OperationMethod::Update => Method::PUT,
            OperationMethod::Delete => Method::DELETE,
        }
    }

    fn remote_error(status: StatusCode, body: &str) -> InfraError {
        let reason = status.canonical_reason().unwrap_or("unknown status");
        let message = if body.trim().is_empty() {
            reason.to_string()
        } else {
            format!("{reason}; body={}", body.trim())
        };
        InfraError::Remote {
            status: status.as_u16(),
            message,
        }
    }

    /// Reads the body of a 2xx create or update. An unusable body is never an
    /// error.
    fn accepted_interval(operation: &NewOperation, body: &str) -> RemoteResponse {
        let parsed = if body.trim().is_empty() {
            None
        } else {
            match serde_json::from_str::<TimedInterval>(body) {
                Ok(parsed) => Some(parsed),
                Err(error) => {
                    warn!(
                        method = operation.method.as_http_method(),
                        endpoint = %operation.target.endpoint(),
                        %error,
                        "accepted time entry response is not decodable"
                    );
                    None
                }
            }
        };

        match (operation.method, parsed) {
            (OperationMethod::Create, Some(created)) if !created.id.trim().is_empty() => {
                RemoteResponse::Interval(created)
            }
            (OperationMethod::Create, _) => {
                warn!(
                    endpoint = %operation.target.endpoint(),
                    "time entry create was accepted without a usable id"
                );
                RemoteResponse::Unidentified
            }
            (_, Some(updated)) => RemoteResponse::Interval(updated),
            (_, None) => match operation.payload.clone() {
                Some(payload) => RemoteResponse::Interval(payload),
                None => RemoteResponse::Unidentified,
            },
        }
    }
}

#[async_trait]
impl RemoteExecutor for ReqwestRemoteExecutor {
    async fn execute(&self, operation: &NewOperation) -> Result<RemoteResponse, InfraError> {
        operation.validate().map_err(InfraError::Validation)?;

        let endpoint = self.endpoint(&operation.target)?;
        let mut request = self
            .client
            .request(Self::http_method(operation.method), endpoint)
            .header(ACCESS_TOKEN_HEADER, &self.access_token);
        if let Some(payload) = operation.payload.as_ref() {
            request = request.json(payload);
        }

        let response = request.send().await.map_err(|error| {
            InfraError::Transport(format!(
                "network error while sending {} {}: {error}",
                operation.method.as_http_method(),
                operation.target.endpoint()
            ))
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            InfraError::Transport(format!("failed reading time entry response: {error}"))
        })?;

        if !status.is_success() {
            return Err(Self::remote_error(status, &body));
        }

        match operation.method {
            OperationMethod::Delete => Ok(RemoteResponse::Deleted),
            OperationMethod::Create | OperationMethod::Update => {
                Ok(Self::accepted_interval(operation, &body))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use mockito::Matcher;

    fn fixed_time(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn executor_for(base_url: &str) -> ReqwestRemoteExecutor {
        ReqwestRemoteExecutor::new(
            Url::parse(base_url).expect("valid base url"),
            "secret-token",
            Duration::from_secs(5),
        )
        .expect("build executor")
    }

    fn running_interval() -> TimedInterval {
        TimedInterval::running(fixed_time("2026-02-16T09:00:00Z"), "standup")
    }

    #[tokio::test]
    async fn create_posts_payload_and_decodes_created_interval() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chrono-test/tasks/t1/times")
            .match_header(ACCESS_TOKEN_HEADER, "secret-token")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "description": "standup",
                "end_date": ""
            })))
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":"time-9","description":"standup","begin_date":"2026-02-16T09:00:00Z","end_date":"","spent_time":0}"#,
            )
            .create_async()
            .await;

        let executor = executor_for(&format!("{}/chrono-test", server.url()));
        let response = executor
            .execute(&NewOperation::create("t1", running_interval()))
            .await
            .expect("create succeeds");

        mock.assert_async().await;
        match response {
            RemoteResponse::Interval(interval) => {
                assert_eq!(interval.id, "time-9");
                assert!(interval.is_running());
            }
            other => panic!("expected interval, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_success_status_becomes_remote_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/tasks/t1/times/time-1")
            .with_status(503)
            .with_body("maintenance")
            .create_async()
            .await;

        let mut interval = running_interval().stopped_at(fixed_time("2026-02-16T09:05:00Z"));
        interval.id = "time-1".to_string();
        let result = executor_for(&server.url())
            .execute(&NewOperation::update("t1", interval))
            .await;

        match result {
            Err(InfraError::Remote { status, message }) => {
                assert_eq!(status, 503);
                assert!(message.contains("maintenance"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_with_empty_body_echoes_payload() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/tasks/t1/times/time-1")
            .with_status(204)
            .create_async()
            .await;

        let mut interval = running_interval().stopped_at(fixed_time("2026-02-16T09:05:00Z"));
        interval.id = "time-1".to_string();
        let response = executor_for(&server.url())
            .execute(&NewOperation::update("t1", interval.clone()))
            .await
            .expect("update succeeds");

        assert_eq!(response, RemoteResponse::Interval(interval));
    }

    #[tokio::test]
    async fn delete_sends_no_body_and_returns_deleted() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/tasks/t1/times/time-1")
            .match_header(ACCESS_TOKEN_HEADER, "secret-token")
            .match_body("")
            .with_status(200)
            .create_async()
            .await;

        let response = executor_for(&server.url())
            .execute(&NewOperation::delete("t1", "time-1"))
            .await
            .expect("delete succeeds");

        mock.assert_async().await;
        assert_eq!(response, RemoteResponse::Deleted);
    }

    #[tokio::test]
    async fn create_without_id_is_accepted_but_unidentified() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/tasks/t1/times")
            .with_status(201)
            .with_body(r#"{"begin_date":"2026-02-16T09:00:00Z","end_date":""}"#)
            .create_async()
            .await;

        let response = executor_for(&server.url())
            .execute(&NewOperation::create("t1", running_interval()))
            .await
            .expect("2xx is never an error");
        assert_eq!(response, RemoteResponse::Unidentified);
    }

    #[tokio::test]
    async fn create_with_undecodable_body_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/tasks/t1/times")
            .with_status(201)
            .with_body("created")
            .expect(1)
            .create_async()
            .await;

        let response = executor_for(&server.url())
            .execute(&NewOperation::create("t1", running_interval()))
            .await
            .expect("2xx is never an error");

        mock.assert_async().await;
        assert_eq!(response, RemoteResponse::Unidentified);
    }

    #[tokio::test]
    async fn update_with_undecodable_body_echoes_payload() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/tasks/t1/times/time-1")
            .with_status(200)
            .with_body("ok")
            .create_async()
            .await;

        let mut interval = running_interval().stopped_at(fixed_time("2026-02-16T09:05:00Z"));
        interval.id = "time-1".to_string();
        let response = executor_for(&server.url())
            .execute(&NewOperation::update("t1", interval.clone()))
            .await
            .expect("update succeeds");

        assert_eq!(response, RemoteResponse::Interval(interval));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let result = executor_for("http://127.0.0.1:1")
            .execute(&NewOperation::delete("t1", "time-1"))
            .await;

        match result {
            Err(error @ InfraError::Transport(_)) => assert!(error.is_remote_failure()),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_operation_is_rejected_before_sending() {
        let mut operation = NewOperation::create("t1", running_interval());
        operation.payload = None;
        let result = executor_for("http://127.0.0.1:1").execute(&operation).await;
        assert!(matches!(result, Err(InfraError::Validation(_))));
    }

    #[test]
    fn empty_access_token_is_rejected() {
        let result = ReqwestRemoteExecutor::new(
            Url::parse("http://127.0.0.1").expect("url"),
            "  ",
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(InfraError::InvalidConfig(_))));
    }
}
