use std::convert::Infallible;
use std::sync::Arc;

use serde_derive::Deserialize;
use tracing::error;
use warp::http::StatusCode;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::provider::HostProvider;

#[derive(Debug)]
struct BadRequest(&'static str);
impl warp::reject::Reject for BadRequest {}

#[derive(Debug)]
struct NotFound(&'static str);
impl warp::reject::Reject for NotFound {}

#[derive(Debug)]
struct Internal;
impl warp::reject::Reject for Internal {}

#[derive(Deserialize)]
struct UriQuery {
    uri: Option<String>,
}

#[derive(Deserialize)]
struct HostQuery {
    host: Option<String>,
}

/// Membership API: host lookup by URI plus operator add/remove.
pub(crate) fn routes(
    provider: Arc<HostProvider>,
) -> impl Filter<Extract = impl Reply, Error = Infallible> + Clone {
    let with_provider = {
        let provider = Arc::clone(&provider);
        warp::any().map(move || Arc::clone(&provider))
    };

    let get_host = warp::path!("host")
        .and(warp::get())
        .and(warp::query::<UriQuery>())
        .and(with_provider.clone())
        .and_then(get_host);

    let get_hosts = warp::path!("hosts")
        .and(warp::get())
        .and(with_provider.clone())
        .and_then(get_hosts);

    let post_host = warp::path!("hosts")
        .and(warp::post())
        .and(warp::query::<HostQuery>())
        .and(with_provider.clone())
        .and_then(post_host);

    let delete_host = warp::path!("hosts")
        .and(warp::delete())
        .and(warp::query::<HostQuery>())
        .and(with_provider)
        .and_then(delete_host);

    get_host
        .or(get_hosts)
        .or(post_host)
        .or(delete_host)
        .recover(handle_rejection)
}

async fn get_host(query: UriQuery, provider: Arc<HostProvider>) -> Result<impl Reply, Rejection> {
    let uri = query.uri.unwrap_or_default();
    match provider.pick(&uri).await {
        Some(host) => Ok(warp::reply::json(&host)),
        None => Err(warp::reject::custom(NotFound("no host available"))),
    }
}

async fn get_hosts(provider: Arc<HostProvider>) -> Result<impl Reply, Rejection> {
    Ok(warp::reply::json(&provider.hosts().await))
}

async fn post_host(query: HostQuery, provider: Arc<HostProvider>) -> Result<impl Reply, Rejection> {
    let Some(host) = query.host.filter(|host| !host.is_empty()) else {
        return Err(warp::reject::custom(BadRequest("host is empty")));
    };

    if let Err(err) = provider.add(&host).await {
        error!("Adding host failed. host: {} err: {:?}", host, err);
        return Err(warp::reject::custom(Internal));
    }
    Ok(warp::reply())
}

async fn delete_host(
    query: HostQuery,
    provider: Arc<HostProvider>,
) -> Result<impl Reply, Rejection> {
    let host = query.host.unwrap_or_default();
    match provider.remove(&host).await {
        Ok(true) => Ok(warp::reply()),
        Ok(false) => Err(warp::reject::custom(NotFound("host not found"))),
        Err(err) => {
            error!("Removing host failed. host: {} err: {:?}", host, err);
            Err(warp::reject::custom(Internal))
        },
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let (status, message) = if let Some(BadRequest(message)) = err.find::<BadRequest>() {
        (StatusCode::BAD_REQUEST, *message)
    } else if let Some(NotFound(message)) = err.find::<NotFound>() {
        (StatusCode::NOT_FOUND, *message)
    } else if err.find::<Internal>().is_some() {
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    } else if err.is_not_found() {
        (StatusCode::NOT_FOUND, "not found")
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (StatusCode::METHOD_NOT_ALLOWED, "method not allowed")
    } else {
        error!("Unhandled rejection: {:?}", err);
        (StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&message),
        status,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn api() -> (
        impl Filter<Extract = impl Reply, Error = Infallible> + Clone,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let storage_file = dir.path().join("hosts.json");
        let provider = Arc::new(HostProvider::load(storage_file).await.unwrap());
        (routes(provider), dir)
    }

    async fn add_host(
        routes: &(impl Filter<Extract = impl Reply, Error = Infallible> + Clone + 'static),
        host: &str,
    ) {
        let response = warp::test::request()
            .method("POST")
            .path(&format!("/hosts?host={host}"))
            .reply(routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn get_host_on_empty_membership_is_not_found() {
        let (routes, _dir) = api().await;

        let response = warp::test::request()
            .method("GET")
            .path("/host?uri=rtsp%3A%2F%2Fcam%2F1")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "no host available");
    }

    #[tokio::test]
    async fn post_without_host_is_a_bad_request() {
        let (routes, _dir) = api().await;

        let response = warp::test::request()
            .method("POST")
            .path("/hosts")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn membership_round_trip() {
        let (routes, _dir) = api().await;
        add_host(&routes, "a").await;
        add_host(&routes, "b").await;

        let response = warp::test::request()
            .method("GET")
            .path("/hosts")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let hosts: Vec<String> = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(hosts, vec!["a", "b"]);

        let response = warp::test::request()
            .method("GET")
            .path("/host?uri=x")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let picked: String = serde_json::from_slice(response.body()).unwrap();
        assert!(picked == "a" || picked == "b");

        let response = warp::test::request()
            .method("DELETE")
            .path("/hosts?host=a")
            .reply(&routes)
            .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = warp::test::request()
            .method("GET")
            .path("/host?uri=x")
            .reply(&routes)
            .await;
        let picked: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(picked, "b");
    }

    #[tokio::test]
    async fn deleting_an_unknown_host_is_not_found() {
        let (routes, _dir) = api().await;

        let response = warp::test::request()
            .method("DELETE")
            .path("/hosts?host=missing")
            .reply(&routes)
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let message: String = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(message, "host not found");
    }
}
