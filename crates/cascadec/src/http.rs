use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;

use cascade_rt::{error as rt_error, form, log};

use crate::ast::{Method, Program, ReturnFormat};
use crate::compile::{RouteTable, ServerConfig};
use crate::eval::{run_route, RequestContext, Runtime, Value};

pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

struct Response {
    status: u16,
    content_type: &'static str,
    body: String,
    suppress_body: bool,
}

const JSON_TYPE: &str = "application/json; charset=utf-8";
const HTML_TYPE: &str = "text/html; charset=utf-8";

/// Blocking accept loop. `CASCADE_MAX_REQUESTS` bounds the number of handled
/// requests so integration tests can drive the real server and get a clean
/// exit.
pub fn serve(
    program: &Program,
    table: &RouteTable,
    config: &ServerConfig,
    rt: &Runtime,
) -> Result<(), String> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener =
        TcpListener::bind(&addr).map_err(|err| format!("failed to bind {addr}: {err}"))?;
    log::info(&format!("listening on {addr}"));
    let max_requests = std::env::var("CASCADE_MAX_REQUESTS")
        .ok()
        .and_then(|val| val.parse::<usize>().ok())
        .unwrap_or(0);
    let mut handled = 0usize;
    for stream in listener.incoming() {
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                log::warn(&format!("failed to accept connection: {err}"));
                continue;
            }
        };
        if handle_connection(program, table, rt, &mut stream) {
            handled += 1;
        }
        if max_requests > 0 && handled >= max_requests {
            break;
        }
    }
    Ok(())
}

/// Returns true when an actual request was parsed and answered; connections
/// that open and close without sending anything (health probes) don't count
/// against `CASCADE_MAX_REQUESTS`.
fn handle_connection(
    program: &Program,
    table: &RouteTable,
    rt: &Runtime,
    stream: &mut TcpStream,
) -> bool {
    let started = Instant::now();
    let request = match read_http_request(stream) {
        Ok(Some(request)) => request,
        Ok(None) => return false,
        Err(err) => {
            log::warn(&format!("bad request: {err}"));
            let response = Response {
                status: 400,
                content_type: JSON_TYPE,
                body: rt_error::error_body("bad request").to_string(),
                suppress_body: false,
            };
            let _ = stream.write_all(render_response(&response).as_bytes());
            return false;
        }
    };
    let response = catch_unwind(AssertUnwindSafe(|| dispatch(program, table, rt, &request)))
        .unwrap_or_else(|_| Response {
            status: 500,
            content_type: JSON_TYPE,
            body: rt_error::internal_error().to_string(),
            suppress_body: false,
        });
    let _ = stream.write_all(render_response(&response).as_bytes());
    log::info(&format!(
        "{} {} {} {}ms",
        request.method,
        request.path,
        response.status,
        started.elapsed().as_millis()
    ));
    true
}

fn dispatch(program: &Program, table: &RouteTable, rt: &Runtime, request: &HttpRequest) -> Response {
    let (path, raw_query) = match request.path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (request.path.as_str(), ""),
    };
    let is_head = request.method.eq_ignore_ascii_case("HEAD");
    let matched = Method::parse(&request.method).and_then(|method| table.lookup(method, path));
    let Some(matched) = matched else {
        return Response {
            status: 404,
            content_type: JSON_TYPE,
            body: rt_error::not_found().to_string(),
            suppress_body: is_head,
        };
    };
    let route = &program.routes[matched.route_index];
    let body = parse_body(request);
    let mut ctx = RequestContext::new(
        matched.params,
        form::parse_pairs(raw_query),
        body,
        request.headers.clone(),
    );
    match run_route(route, &mut ctx, rt) {
        Ok(outcome) => {
            let (content_type, body) = match outcome.format {
                ReturnFormat::Json => (JSON_TYPE, outcome.value.to_json().to_string()),
                ReturnFormat::Html => (HTML_TYPE, outcome.value.to_display_string()),
            };
            Response {
                status: outcome.status,
                content_type,
                body,
                suppress_body: is_head,
            }
        }
        Err(err) => {
            log::error(&format!("evaluation failed: {err}"));
            Response {
                status: 500,
                content_type: JSON_TYPE,
                body: rt_error::internal_error().to_string(),
                suppress_body: is_head,
            }
        }
    }
}

/// Bodies decode by content type: JSON to a structured value, urlencoded
/// forms to a flat string object, anything else (or malformed input) to an
/// empty object.
fn parse_body(request: &HttpRequest) -> Value {
    let content_type = request
        .headers
        .get("content-type")
        .map(String::as_str)
        .unwrap_or("");
    if content_type.starts_with("application/json") {
        return serde_json::from_slice::<serde_json::Value>(&request.body)
            .map(Value::from_json)
            .unwrap_or_else(|_| Value::Object(Default::default()));
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let text = String::from_utf8_lossy(&request.body);
        let fields = form::parse_pairs(&text)
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        return Value::Object(fields);
    }
    Value::Object(Default::default())
}

pub fn read_http_request(stream: &mut TcpStream) -> Result<Option<HttpRequest>, String> {
    let mut buffer = Vec::new();
    let mut temp = [0u8; 1024];
    let mut header_end = None;
    loop {
        let read = stream
            .read(&mut temp)
            .map_err(|err| format!("failed to read request: {err}"))?;
        if read == 0 {
            break;
        }
        buffer.extend_from_slice(&temp[..read]);
        if let Some(pos) = find_header_end(&buffer) {
            header_end = Some(pos);
            break;
        }
        if buffer.len() > 1024 * 1024 {
            return Err("request header too large".to_string());
        }
    }
    if buffer.is_empty() {
        return Ok(None);
    }
    let header_end = header_end.ok_or_else(|| "missing request headers".to_string())?;
    let header_text = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = header_text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| "invalid request line".to_string())?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| "invalid request line".to_string())?
        .to_string();
    let path = parts
        .next()
        .ok_or_else(|| "invalid request line".to_string())?
        .to_string();
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }
    }
    let content_length = headers
        .get("content-length")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let read = stream
            .read(&mut temp)
            .map_err(|err| format!("failed to read body: {err}"))?;
        if read == 0 {
            break;
        }
        body.extend_from_slice(&temp[..read]);
    }
    body.truncate(content_length);
    Ok(Some(HttpRequest {
        method,
        path,
        headers,
        body,
    }))
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|window| window == b"\r\n\r\n")
}

fn render_response(response: &Response) -> String {
    let reason = reason_phrase(response.status);
    let body = if response.suppress_body {
        ""
    } else {
        response.body.as_str()
    };
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        response.status,
        reason,
        response.content_type,
        response.body.len(),
        body
    )
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "OK",
    }
}
