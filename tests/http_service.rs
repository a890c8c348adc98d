use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use roadwatch::service::http::DEFAULT_TIMEOUT;
use roadwatch::{
    CaptureMode, DetectionService, EnrichmentService, HttpDetectionService, ServiceError,
    SignRecord,
};

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: Option<Value>,
}

type Routes = HashMap<(&'static str, &'static str), (u16, String)>;

/// Minimal HTTP/1.1 server: one request per connection, canned responses.
struct StubServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Recorded>>>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl StubServer {
    fn spawn(routes: Routes) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let log = requests.clone();
        let stop = shutdown.clone();
        let join = std::thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, _)) => {
                        if let Err(err) = handle(stream, &routes, &log) {
                            eprintln!("stub server: {}", err);
                        }
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown,
            join: Some(join),
        })
    }

    fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn handle(mut stream: TcpStream, routes: &Routes, log: &Mutex<Vec<Recorded>>) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next().unwrap_or("").split_whitespace();
    let method = request_line.next().unwrap_or("").to_string();
    let path = request_line.next().unwrap_or("").to_string();
    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while data.len() < header_end + content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = &data[header_end..];
    let body = if body.is_empty() {
        None
    } else {
        Some(serde_json::from_slice(body)?)
    };

    let (status, payload) = routes
        .iter()
        .find(|((m, p), _)| *m == method && *p == path)
        .map(|(_, response)| response.clone())
        .unwrap_or((404, r#"{"error":"not_found"}"#.to_string()));
    log.lock().unwrap().push(Recorded { method, path, body });

    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        payload.len(),
        payload
    );
    stream.write_all(response.as_bytes())?;
    Ok(())
}

fn service_for(server: &StubServer) -> HttpDetectionService {
    HttpDetectionService::new(&server.url(), None, DEFAULT_TIMEOUT).expect("service")
}

#[test]
fn lists_cameras() {
    let mut routes = Routes::new();
    routes.insert(("GET", "/cameras"), (200, r#"{"cameras":[0,1]}"#.to_string()));
    let server = StubServer::spawn(routes).unwrap();

    let cameras = service_for(&server).list_cameras().unwrap();
    assert_eq!(cameras, vec![0, 1]);
}

#[test]
fn start_posts_camera_index_to_mode_endpoint() {
    let mut routes = Routes::new();
    routes.insert(
        ("POST", "/start_camera_both"),
        (200, r#"{"message":"Camera started"}"#.to_string()),
    );
    routes.insert(
        ("POST", "/start_camera_pothole"),
        (200, r#"{"message":"Camera started"}"#.to_string()),
    );
    let server = StubServer::spawn(routes).unwrap();
    let service = service_for(&server);

    service.start_capture(CaptureMode::Both, 1).unwrap();
    service.start_capture(CaptureMode::Pothole, 0).unwrap();
    let err = service.start_capture(CaptureMode::Traffic, 0).unwrap_err();
    assert!(matches!(err, ServiceError::Status { status: 404, .. }));

    let requests = server.requests();
    assert_eq!(requests[0].method, "POST");
    assert_eq!(requests[0].path, "/start_camera_both");
    assert_eq!(requests[0].body, Some(json!({ "camera_index": 1 })));
    assert_eq!(requests[1].path, "/start_camera_pothole");
    assert_eq!(requests[1].body, Some(json!({ "camera_index": 0 })));
    assert_eq!(requests[2].path, "/start_camera");
}

#[test]
fn stop_reports_non_success_status() {
    let mut routes = Routes::new();
    routes.insert(("POST", "/stop_camera"), (500, r#"{"error":"busy"}"#.to_string()));
    let server = StubServer::spawn(routes).unwrap();

    let err = service_for(&server).stop_capture().unwrap_err();
    assert!(matches!(err, ServiceError::Status { status: 500, .. }));
    assert!(err.endpoint().ends_with("/stop_camera"));
}

#[test]
fn enrich_posts_labels_and_decodes_records() {
    let mut routes = Routes::new();
    routes.insert(
        ("POST", "/generate"),
        (
            200,
            r#"[{"sign":"stop_sign","details":"Come to a complete stop","action":"Stop"},
                {"sign":"yield","details":"Give way","action":"Slow down"}]"#
                .to_string(),
        ),
    );
    let server = StubServer::spawn(routes).unwrap();

    let labels = vec!["stop_sign".to_string(), "yield".to_string()];
    let records = service_for(&server).enrich(&labels).unwrap();

    assert_eq!(
        records,
        vec![
            SignRecord::new("stop_sign", "Come to a complete stop", "Stop"),
            SignRecord::new("yield", "Give way", "Slow down"),
        ]
    );
    let requests = server.requests();
    assert_eq!(requests[0].body, Some(json!({ "signs": ["stop_sign", "yield"] })));
}

#[test]
fn malformed_sign_list_is_a_decode_error() {
    let mut routes = Routes::new();
    routes.insert(("GET", "/signs"), (200, r#"{"error":"oops"}"#.to_string()));
    let server = StubServer::spawn(routes).unwrap();

    let err = service_for(&server).list_signs().unwrap_err();
    assert!(matches!(err, ServiceError::Decode { .. }));
}

#[test]
fn unreachable_service_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let service = HttpDetectionService::new(
        &format!("http://{}", addr),
        None,
        Duration::from_secs(2),
    )
    .unwrap();
    let err = service.list_signs().unwrap_err();
    assert!(matches!(err, ServiceError::Transport { .. }));
}
