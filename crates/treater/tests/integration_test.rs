use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};

fn free_addr() -> String {
    let listener =
        TcpListener::bind("127.0.0.1:0").expect("Failed to bind ephemeral port for integration test");
    let addr = listener.local_addr().expect("Failed to resolve bound address");
    format!("127.0.0.1:{}", addr.port())
}

fn wait_for_port(addr: &str) {
    let start = Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("nothing listening on {addr}");
}

struct TreaterProcess {
    child: Child,
    api_addr: String,
    metrics_addr: String,
}

impl TreaterProcess {
    fn start(extra: &[&str]) -> Self {
        let api_addr = free_addr();
        let metrics_addr = free_addr();
        let child = Command::new(env!("CARGO_BIN_EXE_treater"))
            .args([
                "--simulate",
                "--no-camera",
                "--api-addr",
                &api_addr,
                "--metrics-addr",
                &metrics_addr,
            ])
            .args(extra)
            .spawn()
            .expect("Failed to start treater");

        wait_for_port(&api_addr);
        wait_for_port(&metrics_addr);
        Self {
            child,
            api_addr,
            metrics_addr,
        }
    }
}

impl Drop for TreaterProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Minimal HTTP/1.1 exchange; returns status code and body.
fn http(addr: &str, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
    )
    .unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").expect("complete response");
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, body.to_string())
}

#[test]
fn status_reports_an_idle_machine() {
    let treater = TreaterProcess::start(&[]);

    let (status, body) = http(&treater.api_addr, "GET", "/api/getStatus");
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["currentStateName"], "Idle");
    assert_eq!(json["treatsIn24h"], 0);
    assert_eq!(json["lastTreatTime"], "");
    assert_eq!(json["minutesSinceLastTreat"], -1);
}

#[test]
fn second_dispense_is_declined_while_busy() {
    let treater = TreaterProcess::start(&[]);

    let (status, body) = http(&treater.api_addr, "POST", "/api/dispenseTreat");
    assert_eq!(status, 200);
    let json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(json["currentStateName"], "Dispensing");

    let (status, body) = http(&treater.api_addr, "POST", "/api/dispenseTreat");
    assert_eq!(status, 429);
    assert!(body.starts_with("Treat machine is busy"));

    let (status, _) = http(&treater.api_addr, "POST", "/api/capturePhoto");
    assert_eq!(status, 500, "captures are disabled");
}

#[test]
fn metrics_endpoint_exports_dispenser_counters() {
    let treater = TreaterProcess::start(&[]);
    thread::sleep(Duration::from_millis(300));

    let (status, body) = http(&treater.metrics_addr, "GET", "/metrics");
    assert_eq!(status, 200);
    assert!(body.contains("treater_ticks_total"));
    assert!(body.contains("treater_machine_state 1"));

    let (status, _) = http(&treater.metrics_addr, "GET", "/ready");
    assert_eq!(status, 200);
}

fn read_lines(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn timed_run_journals_start_and_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let audit = dir.path().join("audit.jsonl");
    let history = dir.path().join("history.json");
    let mut treater = TreaterProcess::start(&[
        "--run-seconds",
        "2",
        "--audit-log",
        audit.to_str().unwrap(),
        "--history",
        history.to_str().unwrap(),
    ]);

    let (status, _) = http(&treater.api_addr, "POST", "/api/dispenseTreat");
    assert_eq!(status, 200);

    let deadline = Instant::now() + Duration::from_secs(10);
    let exit = loop {
        if let Some(exit) = treater.child.try_wait().unwrap() {
            break exit;
        }
        assert!(Instant::now() < deadline, "treater did not stop on its own");
        thread::sleep(Duration::from_millis(100));
    };
    assert!(exit.success());

    let events: Vec<String> = read_lines(&audit)
        .iter()
        .map(|entry| entry["event_type"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(events.first().map(String::as_str), Some("system_start"));
    assert!(events.contains(&"dispense_accepted".to_string()));
    assert_eq!(events.last().map(String::as_str), Some("system_shutdown"));
}
