use std::convert::Infallible;
use std::sync::Arc;

use cq_messages::types::Task;
use cq_messages::types::TaskKind;
use redact::Secret;
use tracing::error;
use warp::http::StatusCode;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::core::Core;
use crate::core::SubmitError;

#[derive(Debug)]
struct Unauthorized;
impl warp::reject::Reject for Unauthorized {}

#[derive(Debug)]
struct BadRequest(String);
impl warp::reject::Reject for BadRequest {}

#[derive(Debug)]
struct NotFound(&'static str);
impl warp::reject::Reject for NotFound {}

#[derive(Debug)]
struct Internal;
impl warp::reject::Reject for Internal {}

/// The coordinator API. All routes are bearer-token protected; errors
/// are rendered as JSON string bodies with the mapped status code.
pub(crate) fn routes(
    core: Arc<Core>,
    auth_token: Arc<Secret<String>>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let with_core = {
        let core = Arc::clone(&core);
        warp::any().map(move || Arc::clone(&core))
    };
    let auth = authorized(auth_token);

    let submit_task = warp::path!("tasks")
        .and(warp::post())
        .and(auth.clone())
        .and(with_core.clone())
        .and(warp::body::json())
        .and_then(submit_task);

    let submit_batch = warp::path!("tasks-batch")
        .and(warp::post())
        .and(auth.clone())
        .and(with_core.clone())
        .and(warp::body::json())
        .and_then(submit_batch);

    let get_task = warp::path!("tasks" / String)
        .and(warp::get())
        .and(auth.clone())
        .and(with_core.clone())
        .and_then(get_task);

    let get_task_result = warp::path!("tasks" / String / "result")
        .and(warp::get())
        .and(auth)
        .and(with_core)
        .and_then(get_task_result);

    submit_task
        .or(submit_batch)
        .or(get_task_result)
        .or(get_task)
        .recover(handle_rejection)
}

/// Rejects any request that does not carry `Authorization: Bearer
/// <token>` with the configured token.
fn authorized(
    auth_token: Arc<Secret<String>>,
) -> impl Filter<Extract = (), Error = Rejection> + Clone {
    warp::header::optional::<String>("authorization")
        .and_then(move |header: Option<String>| {
            let auth_token = Arc::clone(&auth_token);
            async move {
                let presented = header
                    .as_deref()
                    .and_then(|header| header.strip_prefix("Bearer "));
                match presented {
                    Some(presented) if presented == auth_token.expose_secret() => Ok(()),
                    _ => Err(warp::reject::custom(Unauthorized)),
                }
            }
        })
        .untuple_one()
}

async fn submit_task(core: Arc<Core>, task: Task) -> Result<impl Reply, Rejection> {
    match core.submit_task(task).await {
        Ok(id) => Ok(warp::reply::json(&id)),
        Err(err) => Err(submit_rejection(err)),
    }
}

async fn submit_batch(core: Arc<Core>, tasks: Vec<Task>) -> Result<impl Reply, Rejection> {
    match core.submit_batch(tasks).await {
        Ok(ids) => Ok(warp::reply::json(&ids)),
        Err(err) => Err(submit_rejection(err)),
    }
}

fn submit_rejection(err: SubmitError) -> Rejection {
    match err {
        SubmitError::Validation(message) => warp::reject::custom(BadRequest(message)),
        SubmitError::Internal(err) => {
            error!("Task submission failed. err: {:?}", err);
            warp::reject::custom(Internal)
        },
    }
}

async fn get_task(id: String, core: Arc<Core>) -> Result<impl Reply, Rejection> {
    match core.task(&id).await {
        Ok(Some(task)) => Ok(warp::reply::json(&task)),
        Ok(None) => Err(warp::reject::custom(NotFound("task not found"))),
        Err(err) => {
            error!("Loading task failed. id: {} err: {:?}", id, err);
            Err(warp::reject::custom(Internal))
        },
    }
}

async fn get_task_result(id: String, core: Arc<Core>) -> Result<impl Reply, Rejection> {
    let task = match core.task(&id).await {
        Ok(Some(task)) => task,
        Ok(None) => return Err(warp::reject::custom(NotFound("task result not found"))),
        Err(err) => {
            error!("Loading task failed. id: {} err: {:?}", id, err);
            return Err(warp::reject::custom(Internal));
        },
    };

    match task.kind {
        TaskKind::Complex if !task.results.is_empty() => Ok(warp::reply::json(&task.results)),
        TaskKind::Complex => Err(warp::reject::custom(NotFound("task result not found"))),
        _ => match task.result {
            Some(result) => Ok(warp::reply::json(&result)),
            None => Err(warp::reject::custom(NotFound("task result not found"))),
        },
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(BadRequest(message)) = err.find::<BadRequest>() {
        (StatusCode::BAD_REQUEST, message.clone())
    } else if err.find::<Unauthorized>().is_some() {
        (StatusCode::UNAUTHORIZED, "unauthorized".to_owned())
    } else if let Some(NotFound(message)) = err.find::<NotFound>() {
        (StatusCode::NOT_FOUND, (*message).to_owned())
    } else if err.find::<Internal>().is_some() {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_owned(),
        )
    } else if let Some(err) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("bind task: {err}"))
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found".to_owned())
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "method not allowed".to_owned(),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal server error".to_owned(),
        )
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&message),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use cq_messages::types::TaskResult;
    use serde_json::json;

    use super::*;
    use crate::core::TaskSink;
    use crate::storage::TaskStore;

    const TOKEN: &str = "secret-token";

    #[derive(Default)]
    struct MemStore {
        records: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl TaskStore for MemStore {
        async fn task(&self, id: &str) -> anyhow::Result<Option<Task>> {
            let records = self.records.lock().unwrap();
            records
                .get(id)
                .map(|raw| Ok(serde_json::from_str(raw)?))
                .transpose()
        }

        async fn set_task(&self, task: &Task) -> anyhow::Result<()> {
            let raw = serde_json::to_string(task)?;
            self.records.lock().unwrap().insert(task.id.clone(), raw);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemSink {
        published: Mutex<Vec<Task>>,
    }

    #[async_trait]
    impl TaskSink for MemSink {
        async fn publish_task(&self, task: &Task) -> anyhow::Result<()> {
            self.published.lock().unwrap().push(task.clone());
            Ok(())
        }
    }

    fn api() -> (
        impl Filter<Extract = impl Reply, Error = Infallible> + Clone,
        Arc<Core>,
    ) {
        let store = Arc::new(MemStore::default());
        let sink = Arc::new(MemSink::default());
        let core = Arc::new(Core::new(store as _, sink as _));
        let routes = routes(
            Arc::clone(&core),
            Arc::new(Secret::new(TOKEN.to_owned())),
        );
        (routes, core)
    }

    fn bearer() -> String {
        format!("Bearer {TOKEN}")
    }

    fn ping_body() -> serde_json::Value {
        json!({
            "type": "ping",
            "geo_location": "eu",
            "payload": "8.8.8.8",
        })
    }

    #[tokio::test]
    async fn submit_task_returns_the_minted_id() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&ping_body())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let id: String = serde_json::from_slice(response.body()).unwrap();
        assert!(!id.is_empty());
    }

    #[tokio::test]
    async fn submit_task_without_token_is_unauthorized() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .json(&ping_body())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn submit_task_with_wrong_token_is_unauthorized() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", "Bearer nope")
            .json(&ping_body())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn invalid_task_is_a_bad_request() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&json!({"type": "ping", "geo_location": "eu"}))
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "payload is empty");
    }

    #[tokio::test]
    async fn undecodable_body_is_a_bad_request() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .header("content-type", "application/json")
            .body("{not json")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn batch_returns_ids_in_order_and_rejects_wholesale() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks-batch")
            .header("authorization", bearer())
            .json(&json!([ping_body(), ping_body()]))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let ids: Vec<String> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(ids.len(), 2);

        let response = warp::test::request()
            .method("POST")
            .path("/tasks-batch")
            .header("authorization", bearer())
            .json(&json!([ping_body(), {"type": "ping", "geo_location": "eu"}]))
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "task #1: payload is empty");
    }

    #[tokio::test]
    async fn get_task_round_trips() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&ping_body())
            .reply(&routes)
            .await;
        let id: String = serde_json::from_slice(response.body()).unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/tasks/{id}"))
            .header("authorization", bearer())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let task: Task = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.kind, TaskKind::Ping);
    }

    #[tokio::test]
    async fn get_unknown_task_is_not_found() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("GET")
            .path("/tasks/no-such-id")
            .header("authorization", bearer())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "task not found");
    }

    #[tokio::test]
    async fn get_result_before_completion_is_not_found() {
        let (routes, _) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&ping_body())
            .reply(&routes)
            .await;
        let id: String = serde_json::from_slice(response.body()).unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/tasks/{id}/result"))
            .header("authorization", bearer())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "task result not found");
    }

    #[tokio::test]
    async fn get_result_returns_the_simple_report() {
        use cq_bus::TaskResultHandler;

        let (routes, core) = api();

        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&ping_body())
            .reply(&routes)
            .await;
        let id: String = serde_json::from_slice(response.body()).unwrap();

        core.handle_task_result(
            TaskResult::success(&id, &json!({"packets_sent": 100})).unwrap(),
        )
        .await
        .unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/tasks/{id}/result"))
            .header("authorization", bearer())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let result: TaskResult = serde_json::from_slice(response.body()).unwrap();
        assert!(result.ok);
        assert_eq!(result.payload, json!({"packets_sent": 100}));
    }

    #[tokio::test]
    async fn get_result_returns_the_results_array_for_complex() {
        use cq_bus::TaskResultHandler;

        let (routes, core) = api();

        let body = json!({
            "type": "complex",
            "geo_location": "eu",
            "payloads": [
                {"type": "ping", "payload": "8.8.8.8"},
                {"type": "ping", "payload": "8.8.4.4"},
            ],
        });
        let response = warp::test::request()
            .method("POST")
            .path("/tasks")
            .header("authorization", bearer())
            .json(&body)
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let id: String = serde_json::from_slice(response.body()).unwrap();

        core.handle_task_result(TaskResult::failure(&id, "failed to ping: timeout"))
            .await
            .unwrap();

        let response = warp::test::request()
            .method("GET")
            .path(&format!("/tasks/{id}/result"))
            .header("authorization", bearer())
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        let results: Vec<TaskResult> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].ok);
    }
}
