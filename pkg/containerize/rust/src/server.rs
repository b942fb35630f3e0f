// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! HTTP routes of the conversion service.

use anyhow::{Context, Result, anyhow};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response, StatusCode};
use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::convert::Converter;
use crate::errors::Error;
use crate::host;
use crate::progress;

/// Request header carrying a progress token from `/progress/generate`.
pub const PROGRESS_HEADER: &str = "x-dd-progress";

pub type HttpResponse = Response<BoxBody<Bytes, std::io::Error>>;

static BADREQUEST: &[u8] = b"Bad request";
static NOTFOUND: &[u8] = b"Not found";

pub async fn handle_request<B>(converter: Converter, req: Request<B>) -> Result<HttpResponse> {
    let token = req
        .headers()
        .get(PROGRESS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let path = req.uri().path().to_string();
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (req.method(), segments.as_slice()) {
        (&Method::GET, ["processes"]) => handle_list(&converter).await,
        (&Method::GET, ["processes", pid]) => match pid.parse() {
            Ok(pid) => handle_inspect(converter, pid, token).await,
            Err(_) => bad_request(),
        },
        (&Method::GET, ["processes", pid, "convert"]) => match pid.parse() {
            Ok(pid) => handle_convert(converter, pid, token).await,
            Err(_) => bad_request(),
        },
        (&Method::GET, ["progress", "generate"]) => {
            json_response(StatusCode::OK, &json!({ "key": progress::generate_key() }))
        }
        (&Method::GET, ["progress", "status", key]) => {
            match progress::status(converter.progress(), key) {
                Ok(status) => json_response(StatusCode::OK, &json!({ "status": status })),
                Err(e) => error_response(StatusCode::NOT_FOUND, &e),
            }
        }
        (&Method::GET, ["checkhost"]) => handle_check_host(&converter).await,
        _ => {
            info!("{} Request to unknown endpoint: {}", req.method(), path);
            not_found()
        }
    }
}

async fn handle_list(converter: &Converter) -> Result<HttpResponse> {
    match converter.list().await {
        Ok(processes) => {
            info!("Found {} listening processes", processes.len());
            json_response(StatusCode::OK, &json!({ "processes": processes }))
        }
        Err(e) => {
            error!("Failed to list processes: {e}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e)
        }
    }
}

// Inspection and conversion run detached from the connection: a client going
// away must not leave a stopped process behind.
async fn handle_inspect(converter: Converter, pid: i32, token: Option<String>) -> Result<HttpResponse> {
    let inspection = tokio::spawn(async move { converter.inspect(pid, token).await })
        .await
        .context("inspection task failed")?;
    match inspection {
        Ok(inspection) => json_response(StatusCode::OK, &inspection),
        Err(e) => {
            warn!("Inspection of pid {pid} failed: {e}");
            error_response(StatusCode::NOT_FOUND, &e)
        }
    }
}

async fn handle_convert(converter: Converter, pid: i32, token: Option<String>) -> Result<HttpResponse> {
    let conversion = tokio::spawn(async move { converter.convert(pid, token).await })
        .await
        .context("conversion task failed")?;
    match conversion {
        Ok(tag) => json_response(
            StatusCode::OK,
            &json!({ "message": format!("Process {pid} converted to Docker image {tag}") }),
        ),
        Err(e) => {
            error!("Conversion of pid {pid} failed: {e}");
            let status = match e {
                Error::Procfs { .. } | Error::Discovery { .. } => StatusCode::NOT_FOUND,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &e)
        }
    }
}

#[derive(Serialize)]
struct HostCheck<'a> {
    message: String,
    #[serde(flatten)]
    report: &'a host::HostReport,
}

async fn handle_check_host(converter: &Converter) -> Result<HttpResponse> {
    match host::check(converter.executor()).await {
        Ok(report) => json_response(
            StatusCode::OK,
            &HostCheck {
                message: report.message(),
                report: &report,
            },
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e),
    }
}

fn json_response<T: Serialize + ?Sized>(status: StatusCode, body: &T) -> Result<HttpResponse> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(
            Full::new(
                serde_json::to_vec(body)
                    .unwrap_or_else(|e| {
                        error!("Failed to serialize response: {e}");
                        b"Internal server error".to_vec()
                    })
                    .into(),
            )
            .map_err(|e| match e {})
            .boxed(),
        )
        .map_err(|e| anyhow!("Failed to build response: {}", e))
}

fn error_response(status: StatusCode, err: &Error) -> Result<HttpResponse> {
    json_response(
        status,
        &json!({ "error": err.kind(), "message": err.to_string() }),
    )
}

fn bad_request() -> Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(Full::new(BADREQUEST.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("Failed to build bad request response: {}", e))
}

fn not_found() -> Result<HttpResponse> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(NOTFOUND.into()).map_err(|e| match e {}).boxed())
        .map_err(|e| anyhow!("Failed to build not found response: {}", e))
}

/// Response of last resort when a handler failed.
pub fn internal_error() -> HttpResponse {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(
            Full::new(Bytes::from(&b"Internal Server Error"[..]))
                .map_err(|e| match e {})
                .boxed(),
        )
        .unwrap_or_else(|_| {
            Response::new(
                Full::new(Bytes::from(&b"Error"[..]))
                    .map_err(|e| match e {})
                    .boxed(),
            )
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::Config;
    use crate::progress::{InMemoryProgressStore, ProgressStore};
    use crate::testing::ScriptedExecutor;

    fn converter(executor: Arc<ScriptedExecutor>, store: Arc<InMemoryProgressStore>) -> Converter {
        Converter::new(Arc::new(Config::default()), executor, store)
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_json(response: HttpResponse) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let converter = converter(Arc::default(), Arc::default());
        let response = handle_request(converter, get("/nothing/here")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_host() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor
            .on(&["dpkg-query"], 1, "net-tools\tinstall ok installed\n")
            .on(&["docker", "version"], 1, "");
        let converter = converter(executor, Arc::default());

        let response = handle_request(converter, get("/checkhost")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["os"].is_string());
        assert_eq!(
            body["missingPackages"],
            json!(["rsync", "strace", "apt-rdepends", "dpkg-repack"])
        );
        assert_eq!(body["dockerAvailable"], json!(false));
        assert!(
            body["message"]
                .as_str()
                .unwrap()
                .ends_with("docker is not available")
        );
    }

    #[tokio::test]
    async fn test_non_numeric_pid() {
        let converter = converter(Arc::default(), Arc::default());
        let response = handle_request(converter, get("/processes/nginx")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_progress_status() {
        let store = Arc::new(InMemoryProgressStore::new());
        store.set("abc", 50);
        let converter = converter(Arc::default(), store);

        let response = handle_request(converter.clone(), get("/progress/status/abc"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], 50);

        let response = handle_request(converter, get("/progress/status/xyz"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = body_json(response).await;
        assert_eq!(body["error"], "ProgressKeyError");
        assert_eq!(body["message"], "Cannot find progress key xyz");
    }

    #[tokio::test]
    async fn test_progress_generate() {
        let converter = converter(Arc::default(), Arc::default());
        let response = handle_request(converter, get("/progress/generate"))
            .await
            .unwrap();
        let body = body_json(response).await;
        let key = body["key"].as_str().unwrap();
        assert_eq!(key.len(), 36);
    }

    #[tokio::test]
    async fn test_list_failure() {
        let executor = Arc::new(ScriptedExecutor::new());
        executor.on(&["netstat"], 2, "");
        let converter = converter(executor, Arc::default());

        let response = handle_request(converter, get("/processes")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "DiscoveryError");
    }

    #[tokio::test]
    async fn test_convert_without_socket() {
        let executor = Arc::new(ScriptedExecutor::new());
        let converter = converter(executor, Arc::default());

        let response = handle_request(converter, get("/processes/4242/convert"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "DiscoveryError");
    }
}
