// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2025-present Datadog, Inc.

//! Drives the HTTP routes end to end with scripted host commands.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dd_containerize::progress::InMemoryProgressStore;
use dd_containerize::server::{HttpResponse, PROGRESS_HEADER, handle_request};
use dd_containerize::testing::ScriptedExecutor;
use dd_containerize::{Config, Converter};
use http_body_util::BodyExt;
use hyper::{Request, StatusCode};
use serde_json::Value;
use tempfile::TempDir;

const NETSTAT: &str = "\
Active Internet connections (only servers)
Proto Recv-Q Send-Q Local Address           Foreign Address         State       PID/Program name
tcp        0      0 0.0.0.0:80              0.0.0.0:*               LISTEN      812/nginx: master p
tcp        0      0 0.0.0.0:22              0.0.0.0:*               LISTEN      640/sshd
tcp        0      0 0.0.0.0:43811           0.0.0.0:*               LISTEN      555/rpc.statd
tcp6       0      0 :::80                   :::*                    LISTEN      812/nginx: master p
";

struct Fixture {
    // Held for the lifetime of the test.
    _dir: TempDir,
    root: PathBuf,
    executor: Arc<ScriptedExecutor>,
    converter: Converter,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let mut config = Config {
            app_space: root.join("space"),
            ..Config::default()
        };
        config.trace.stop_timeout_secs = 1;

        let executor = Arc::new(ScriptedExecutor::new());
        let converter = Converter::new(
            Arc::new(config),
            executor.clone(),
            Arc::new(InMemoryProgressStore::new()),
        );
        Fixture {
            _dir: dir,
            root,
            executor,
            converter,
        }
    }

    /// Scripts a stop, trace and restart of the current process during
    /// which `file` is opened.
    fn script_trace(&self, file: &Path) {
        let strace = format!(
            "openat(AT_FDCWD, \"{}\", O_RDONLY|O_CLOEXEC) = 3\n\
             openat(AT_FDCWD, \"/etc/ld.so.preload\", O_RDONLY|O_CLOEXEC) = -1 ENOENT (No such file or directory)\n\
             [pid    12] openat(AT_FDCWD, \"/dev/null\", O_RDWR) = 4\n",
            file.display()
        );
        self.executor
            .on(&["dpkg", "-S"], 1, "")
            .on(&["service"], 1, "")
            .on(&["kill", "-0"], 1, "")
            .on_output(&["chroot"], 0, "", &strace);
    }

    async fn get(&self, path: &str, token: Option<&str>) -> HttpResponse {
        let mut request = Request::builder().uri(path);
        if let Some(token) = token {
            request = request.header(PROGRESS_HEADER, token);
        }
        handle_request(self.converter.clone(), request.body(()).unwrap())
            .await
            .unwrap()
    }
}

async fn body_json(response: HttpResponse) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn own_pid() -> u32 {
    std::process::id()
}

#[tokio::test]
async fn test_list_processes() {
    let fixture = Fixture::new();
    fixture.executor.on(&["netstat"], 0, NETSTAT);

    let response = fixture.get("/processes", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(
        body,
        serde_json::json!({
            "processes": [{ "port": "80", "pid": "812", "program": "nginx" }]
        })
    );
}

#[tokio::test]
async fn test_inspect_missing_process() {
    let fixture = Fixture::new();

    let response = fixture.get("/processes/-1", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"], "ProcfsError");
    assert!(fixture.executor.calls().is_empty());
}

#[tokio::test]
async fn test_inspect_reports_traced_files() {
    let fixture = Fixture::new();
    let data = fixture.root.join("data");
    fs::create_dir_all(&data).unwrap();
    let file = data.join("settings.ini");
    fs::write(&file, "listen = 8080\n").unwrap();
    fixture.script_trace(&file);

    let response = fixture.get("/progress/generate", None).await;
    let key = body_json(response).await["key"]
        .as_str()
        .unwrap()
        .to_string();

    let pid = own_pid();
    let response = fixture
        .get(&format!("/processes/{pid}"), Some(key.as_str()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;

    let exe = fs::read_link("/proc/self/exe").unwrap();
    assert_eq!(body["exe"].as_str(), exe.to_str());
    assert_eq!(body["packagesSequence"], serde_json::json!([]));
    assert_eq!(
        body["openedFiles"],
        serde_json::json!([{ "path": file, "isDirectory": false }])
    );
    assert!(fixture.executor.ran(&["kill", "-TERM", &pid.to_string()]));
    assert!(fixture.executor.ran(&["service", body["bin"].as_str().unwrap(), "start"]));

    // The token is gone once the inspection is over.
    let response = fixture
        .get(&format!("/progress/status/{key}"), None)
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_json(response).await["error"], "ProgressKeyError");
}

#[tokio::test]
async fn test_convert_unpackaged_process() {
    let fixture = Fixture::new();
    let data = fixture.root.join("data");
    fs::create_dir_all(&data).unwrap();
    let file = data.join("settings.ini");
    fs::write(&file, "listen = 8080\n").unwrap();

    let pid = own_pid();
    let netstat = format!(
        "tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN      {pid}/my_app\n"
    );
    fixture.executor.on(&["netstat"], 0, &netstat);
    fixture.script_trace(&file);

    let response = fixture
        .get(&format!("/processes/{pid}/convert"), None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["message"],
        format!("Process {pid} converted to Docker image dd-agent/myapp:8080")
    );

    let context = fixture.root.join("space/my_app");
    let dockerfile = fs::read_to_string(context.join("Dockerfile")).unwrap();
    assert!(dockerfile.starts_with("FROM dd-agent/baseimage\n"));
    assert!(dockerfile.contains("EXPOSE 8080"));
    assert!(context.join("workingDirectory/cmdScript.sh").exists());

    let exe = fs::read_link("/proc/self/exe").unwrap();
    assert!(fixture.executor.ran(&["cp", "-a", "--parents", &file.to_string_lossy()]));
    assert!(fixture.executor.ran(&["cp", "-a", "--parents", &exe.to_string_lossy()]));
    assert!(!fixture.executor.ran(&["dpkg-repack"]));
    assert!(fixture.executor.ran(&[
        "docker",
        "build",
        "-t",
        "dd-agent/myapp:8080",
        &context.to_string_lossy()
    ]));
}

#[tokio::test]
async fn test_convert_build_failure() {
    let fixture = Fixture::new();
    let data = fixture.root.join("data");
    fs::create_dir_all(&data).unwrap();
    let file = data.join("settings.ini");
    fs::write(&file, "").unwrap();

    let pid = own_pid();
    let netstat = format!(
        "tcp        0      0 0.0.0.0:8080            0.0.0.0:*               LISTEN      {pid}/my_app\n"
    );
    fixture.executor.on(&["netstat"], 0, &netstat);
    fixture.script_trace(&file);
    fixture
        .executor
        .on_output(&["docker", "build"], 1, "", "no space left on device");

    let response = fixture
        .get(&format!("/processes/{pid}/convert"), Some("token"))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["error"], "ImageBuildError");

    let response = fixture.get("/progress/status/token", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
