use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

fn write_temp_file(name: &str, ext: &str, contents: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    path.push(format!("{name}_{stamp}.{ext}"));
    fs::write(&path, contents).expect("failed to write temp file");
    path
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

struct Server {
    child: Child,
    port: u16,
}

impl Server {
    fn spawn(source: &str, max_requests: usize) -> Self {
        let path = write_temp_file("cascade_server", "css", source);
        let port = free_port();
        let child = Command::new(env!("CARGO_BIN_EXE_cascade"))
            .arg(&path)
            .arg("-p")
            .arg(port.to_string())
            .arg("-h")
            .arg("127.0.0.1")
            .env("CASCADE_MAX_REQUESTS", max_requests.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to spawn cascade");
        let server = Server { child, port };
        server.wait_until_ready();
        server
    }

    fn wait_until_ready(&self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if TcpStream::connect(("127.0.0.1", self.port)).is_ok() {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("server did not start listening on port {}", self.port);
    }

    fn request(&self, raw: &str) -> (u16, Vec<(String, String)>, String) {
        let mut stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("connect to server");
        stream
            .write_all(raw.as_bytes())
            .expect("write request");
        let mut response = Vec::new();
        stream.read_to_end(&mut response).expect("read response");
        parse_response(&response)
    }

    fn get(&self, path: &str) -> (u16, Vec<(String, String)>, String) {
        self.request(&format!(
            "GET {path} HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n"
        ))
    }

    fn finish(mut self) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            match self.child.try_wait().expect("wait for server") {
                Some(status) => {
                    assert!(status.success(), "server exited with {status}");
                    return;
                }
                None if Instant::now() > deadline => {
                    let _ = self.child.kill();
                    panic!("server did not exit after serving its request limit");
                }
                None => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn parse_response(raw: &[u8]) -> (u16, Vec<(String, String)>, String) {
    let text = String::from_utf8_lossy(raw).into_owned();
    let (head, body) = text
        .split_once("\r\n\r\n")
        .expect("response has a header section");
    let mut lines = head.split("\r\n");
    let status_line = lines.next().expect("status line");
    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .expect("status code")
        .parse()
        .expect("numeric status");
    let headers = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    (status, headers, body.to_string())
}

fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

fn body_json(body: &str) -> serde_json::Value {
    serde_json::from_str(body).expect("JSON body")
}

fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cascade"))
        .args(args)
        .output()
        .expect("run cascade")
}

const APP_SOURCE_TEMPLATE: &str = r#"
@server {
  host: "127.0.0.1";
  database: "__DB__";
}

@database {
  CREATE TABLE IF NOT EXISTS t(id INTEGER PRIMARY KEY AUTOINCREMENT, n TEXT);
}

[path="/ping"]:GET { @return json({"ok": true}); }

[path="/u/:id"]:GET {
  --id: param(:id);
  @return json({"id": var(--id)});
}

[path="/t"]:POST {
  --n: body(n);
  @return json(sql("INSERT INTO t(n) VALUES (?)", var(--n)));
}

[path="/a"]:GET {
  --r: header(x-role);
  status: if(--r = admin: 200; else: 403);
  @return json(if(--r = admin: {"ok": true}; else: {"err": "nope"}));
}

[path="/age"]:GET {
  --a: query(age);
  @return json(if(--a >= 18: {"k": "adult"}; --a >= 13: {"k": "teen"}; else: {"k": "child"}));
}

[path="/page"]:GET { @return html("<h1>hi</h1>"); }

[path="*"]:GET { @return json({"fallback": true}); }
"#;

fn app_source() -> String {
    let db_path = write_temp_file("cascade_app", "db", "");
    fs::remove_file(&db_path).ok();
    APP_SOURCE_TEMPLATE.replace("__DB__", &db_path.display().to_string())
}

#[test]
fn serves_the_full_application() {
    let source = app_source();
    let server = Server::spawn(&source, 10);

    let (status, headers, body) = server.get("/ping");
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "content-type"),
        Some("application/json; charset=utf-8")
    );
    assert_eq!(body_json(&body), serde_json::json!({"ok": true}));

    let (status, _, body) = server.get("/u/7");
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"id": "7"}));

    let payload = r#"{"n":"x"}"#;
    let (status, _, body) = server.request(&format!(
        "POST /t HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    ));
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"id": 1, "changes": 1}));

    let (status, _, body) = server.request(
        "GET /a HTTP/1.1\r\nHost: 127.0.0.1\r\nX-Role: admin\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"ok": true}));

    let (status, _, body) = server.get("/a");
    assert_eq!(status, 403);
    assert_eq!(body_json(&body), serde_json::json!({"err": "nope"}));

    let (_, _, body) = server.get("/age?age=15");
    assert_eq!(body_json(&body), serde_json::json!({"k": "teen"}));
    let (_, _, body) = server.get("/age?age=8");
    assert_eq!(body_json(&body), serde_json::json!({"k": "child"}));
    let (_, _, body) = server.get("/age?age=abc");
    assert_eq!(body_json(&body), serde_json::json!({"k": "child"}));

    let (status, _, body) = server.get("/nope");
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"fallback": true}));

    let (status, headers, body) = server.get("/page");
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "content-type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(body, "<h1>hi</h1>");

    server.finish();
}

#[test]
fn head_and_not_found_behavior() {
    let source = r#"
[path="/ping"]:GET { @return json({"ok": true}); }
"#;
    let server = Server::spawn(source, 3);

    let (status, headers, body) = server.request(
        "HEAD /ping HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n",
    );
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "content-type"),
        Some("application/json; charset=utf-8")
    );
    assert_eq!(body, "", "HEAD responses carry no body");

    let (status, _, body) = server.get("/missing");
    assert_eq!(status, 404);
    assert_eq!(body_json(&body), serde_json::json!({"error": "Not Found"}));

    let (status, _, body) = server.get("/ping");
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"ok": true}));

    server.finish();
}

#[test]
fn urlencoded_bodies_decode_to_flat_objects() {
    let source = r#"
[path="/form"]:POST {
  --who: body(who);
  @return json({"who": var(--who)});
}
"#;
    let server = Server::spawn(source, 1);
    let payload = "who=ada+l&ignored=1";
    let (status, _, body) = server.request(&format!(
        "POST /form HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        payload.len(),
        payload
    ));
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"who": "ada l"}));
    server.finish();
}

#[test]
fn if_with_no_match_yields_json_null() {
    let source = r#"
[path="/maybe"]:GET {
  --a: query(a);
  @return json(if(--a = 1: one));
}
"#;
    let server = Server::spawn(source, 1);
    let (status, headers, body) = server.get("/maybe");
    assert_eq!(status, 200);
    assert_eq!(
        header(&headers, "content-type"),
        Some("application/json; charset=utf-8")
    );
    assert_eq!(body, "null");
    server.finish();
}

#[test]
fn parse_errors_exit_with_code_one() {
    let path = write_temp_file("cascade_bad", "css", "[path=\"/x\"]:GET { oops; }");
    let output = run_cli(&[path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error:"), "stderr: {stderr}");
}

#[test]
fn database_open_failure_exits_with_code_two() {
    let source = r#"
@server { database: "/nonexistent-dir/cascade/x.db"; }
[path="/x"]:GET { @return json(1); }
"#;
    let path = write_temp_file("cascade_baddb", "css", source);
    let output = run_cli(&[path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn bind_failure_exits_with_code_three() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("occupy a port");
    let port = listener.local_addr().expect("addr").port();
    let path = write_temp_file(
        "cascade_bind",
        "css",
        "[path=\"/x\"]:GET { @return json(1); }",
    );
    let output = run_cli(&[
        path.to_str().expect("utf8 path"),
        "-p",
        &port.to_string(),
        "-h",
        "127.0.0.1",
    ]);
    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn check_flag_validates_without_serving() {
    let path = write_temp_file(
        "cascade_check",
        "css",
        "[path=\"/x\"]:GET { @return json(1); }",
    );
    let output = run_cli(&["--check", path.to_str().expect("utf8 path")]);
    assert_eq!(output.status.code(), Some(0));
}

#[test]
fn version_flag_prints_version() {
    let output = run_cli(&["--version"]);
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with("cascade "), "stdout: {stdout}");
}

#[test]
fn env_values_resolve_at_load_time() {
    let source = r#"
@server { host: env(CASCADE_TEST_HOST, "broken"); }
[path="/x"]:GET { @return json({"ok": true}); }
"#;
    let path = write_temp_file("cascade_env", "css", source);
    let port = free_port();
    let mut child = Command::new(env!("CARGO_BIN_EXE_cascade"))
        .arg(&path)
        .arg("-p")
        .arg(port.to_string())
        .env("CASCADE_TEST_HOST", "127.0.0.1")
        .env("CASCADE_MAX_REQUESTS", "1")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn cascade");
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut connected = None;
    while Instant::now() < deadline {
        if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)) {
            connected = Some(stream);
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    let Some(mut stream) = connected else {
        let _ = child.kill();
        panic!("server did not bind to the env-configured host");
    };
    stream
        .write_all(b"GET /x HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .expect("write request");
    let mut response = Vec::new();
    stream.read_to_end(&mut response).expect("read response");
    let (status, _, body) = parse_response(&response);
    assert_eq!(status, 200);
    assert_eq!(body_json(&body), serde_json::json!({"ok": true}));
    let _ = child.wait();
}
