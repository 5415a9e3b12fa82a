//! Prometheus metrics for Treater observability.
//!
//! This module provides metrics collection for the dispenser loop and the
//! capture engine.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::LazyLock;
use std::thread;
use tiny_http::{Response, Server};

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).unwrap();
    REGISTRY.register(Box::new(counter.clone())).unwrap();
    counter
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).unwrap();
    REGISTRY.register(Box::new(gauge.clone())).unwrap();
    gauge
}

// ============================================================================
// Dispenser Metrics
// ============================================================================

/// Dispenser poll ticks executed
pub static TICKS: LazyLock<IntCounter> =
    LazyLock::new(|| counter("treater_ticks_total", "Dispenser poll ticks executed"));

/// Ticks that failed and were skipped
pub static TICK_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_tick_errors_total",
        "Dispenser poll ticks that failed and were skipped",
    )
});

/// Completed dispense cycles
pub static DISPENSE_CYCLES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_dispense_cycles_total",
        "Completed dispense cycles",
    )
});

pub static TREATS_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_treats_detected_total",
        "Treats seen by the treat detector",
    )
});

/// Dispense requests declined because the machine was busy
pub static DISPENSE_REJECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_dispense_rejected_total",
        "Dispense requests declined because the machine was busy",
    )
});

/// Machine state (0=stopped,1=idle,2=light_lcd,3=dispensing,4=recovering)
pub static MACHINE_STATE: LazyLock<IntGauge> = LazyLock::new(|| {
    gauge(
        "treater_machine_state",
        "Machine state (0=stopped,1=idle,2=light_lcd,3=dispensing,4=recovering)",
    )
});

// ============================================================================
// Capture Metrics
// ============================================================================

pub static CAPTURES: LazyLock<IntCounter> =
    LazyLock::new(|| counter("treater_captures_total", "Completed full captures"));

pub static CAPTURE_FAILURES: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_capture_failures_total",
        "Capture triggers or processes that failed",
    )
});

/// Capture waiters that gave up before a capture completed
pub static WAITER_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_capture_waiter_timeouts_total",
        "Capture requests that timed out waiting for a capture",
    )
});

pub static MOTION_DETECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    counter(
        "treater_motion_detections_total",
        "Low-resolution frames that exceeded the motion sensitivity",
    )
});

/// Motion capture loop status (1 = running, 0 = stopped)
pub static MOTION_RUNNING: LazyLock<IntGauge> = LazyLock::new(|| {
    gauge(
        "treater_motion_running",
        "Motion capture loop status (1=running, 0=stopped)",
    )
});

// ============================================================================
// Metrics HTTP Server
// ============================================================================

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            let path = request.url();

            match path {
                "/metrics" => {
                    let encoder = TextEncoder::new();
                    let metric_families = REGISTRY.gather();
                    let mut buffer = Vec::new();

                    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
                        tracing::warn!("Failed to encode metrics: {}", e);
                        let _ = request.respond(
                            Response::from_string("Internal Server Error").with_status_code(500),
                        );
                        continue;
                    }

                    let response = Response::from_data(buffer).with_header(
                        tiny_http::Header::from_bytes(
                            &b"Content-Type"[..],
                            &b"text/plain; version=0.0.4"[..],
                        )
                        .unwrap(),
                    );
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once the dispenser has ticked
                    if TICKS.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

/// Initialize all metrics (forces lazy initialization)
pub fn init_metrics() {
    let _ = TICKS.get();
    let _ = TICK_ERRORS.get();
    let _ = DISPENSE_CYCLES.get();
    let _ = TREATS_DETECTED.get();
    let _ = DISPENSE_REJECTED.get();
    let _ = MACHINE_STATE.get();
    let _ = CAPTURES.get();
    let _ = CAPTURE_FAILURES.get();
    let _ = WAITER_TIMEOUTS.get();
    let _ = MOTION_DETECTIONS.get();
    let _ = MOTION_RUNNING.get();
}
