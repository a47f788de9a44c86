//! Plaintext metrics HTTP endpoint.
//!
//! A minimal blocking HTTP server in a dedicated thread that exposes the
//! server counters in Prometheus exposition format. Only `GET /metrics` is
//! served.

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::shared::SharedStateHandle;

/// Start the metrics HTTP server in a background thread.
pub fn start_metrics_server(bind: SocketAddr, shared: SharedStateHandle, start_time: Instant) {
    thread::Builder::new()
        .name("metrics".to_string())
        .spawn(move || {
            if let Err(e) = run_metrics_server(bind, shared, start_time) {
                error!("metrics server error: {}", e);
            }
        })
        .expect("Failed to spawn metrics thread");

    info!("metrics endpoint enabled at http://{}/metrics", bind);
}

fn run_metrics_server(
    bind: SocketAddr,
    shared: SharedStateHandle,
    start_time: Instant,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind)?;

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                if let Err(e) = handle_request(stream, &shared, start_time) {
                    debug!("metrics request error: {}", e);
                }
            }
            Err(e) => {
                warn!("metrics accept error: {}", e);
            }
        }
    }

    Ok(())
}

fn handle_request(
    mut stream: TcpStream,
    shared: &SharedStateHandle,
    start_time: Instant,
) -> std::io::Result<()> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.set_write_timeout(Some(Duration::from_secs(5)))?;

    let mut reader = BufReader::new(&stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return send_response(&mut stream, 400, "Bad Request", "Invalid request");
    }
    let (method, path) = (parts[0], parts[1]);

    if method != "GET" {
        return send_response(&mut stream, 405, "Method Not Allowed", "Only GET is supported");
    }
    if path != "/metrics" && path != "/metrics/" {
        return send_response(&mut stream, 404, "Not Found", "Use /metrics");
    }

    // Drain remaining request headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line)?;
        if line.trim().is_empty() {
            break;
        }
    }

    let body = format_metrics(shared, start_time);
    send_response(&mut stream, 200, "OK", &body)
}

fn send_response(
    stream: &mut TcpStream,
    status: u16,
    status_text: &str,
    body: &str,
) -> std::io::Result<()> {
    let content_type = if status == 200 {
        "text/plain; version=0.0.4; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    };

    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    );
    stream.write_all(response.as_bytes())
}

fn format_metrics(shared: &SharedStateHandle, start_time: Instant) -> String {
    let stats = &shared.stats;
    let mut out = String::with_capacity(1024);

    let counters = [
        (
            "rtlite_connections_total",
            "Connections accepted since start",
            stats.connections_total.load(Ordering::Relaxed),
        ),
        (
            "rtlite_msgs_received_total",
            "Frames received from clients",
            stats.msgs_received.load(Ordering::Relaxed),
        ),
        (
            "rtlite_msgs_sent_total",
            "Frames queued to clients",
            stats.msgs_sent.load(Ordering::Relaxed),
        ),
        (
            "rtlite_msgs_dropped_total",
            "Frames dropped on backpressure",
            stats.msgs_dropped.load(Ordering::Relaxed),
        ),
        (
            "rtlite_bytes_received_total",
            "Bytes read from client sockets",
            stats.bytes_received.load(Ordering::Relaxed),
        ),
        (
            "rtlite_bytes_sent_total",
            "Bytes written to client sockets",
            stats.bytes_sent.load(Ordering::Relaxed),
        ),
        (
            "rtlite_broadcasts_total",
            "Broadcasts submitted to registries",
            stats.broadcasts.load(Ordering::Relaxed),
        ),
        (
            "rtlite_broadcast_receivers_total",
            "Sum of subscriber counts over all broadcasts",
            stats.broadcast_receivers.load(Ordering::Relaxed),
        ),
    ];

    for (name, help, value) in counters {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
        ));
    }

    out.push_str(
        "# HELP rtlite_clients_connected Currently connected clients\n\
         # TYPE rtlite_clients_connected gauge\n",
    );
    out.push_str(&format!(
        "rtlite_clients_connected {}\n",
        stats.clients_connected.load(Ordering::Relaxed)
    ));

    out.push_str(
        "# HELP rtlite_subscribed_names Names with at least one local subscriber\n\
         # TYPE rtlite_subscribed_names gauge\n",
    );
    for (label, count) in shared.subscription_counts() {
        out.push_str(&format!(
            "rtlite_subscribed_names{{topic=\"{label}\"}} {count}\n"
        ));
    }

    out.push_str(
        "# HELP rtlite_uptime_seconds Seconds since server start\n\
         # TYPE rtlite_uptime_seconds gauge\n",
    );
    out.push_str(&format!(
        "rtlite_uptime_seconds {}\n",
        start_time.elapsed().as_secs()
    ));

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::LoopbackTransport;
    use crate::shared::SharedState;
    use std::sync::Arc;

    #[test]
    fn test_format_metrics_contains_counters() {
        let shared: SharedStateHandle = Arc::new(SharedState::new(
            Arc::from("node-a"),
            Arc::new(LoopbackTransport),
        ));
        shared.stats.add_msgs_received(5);
        let body = format_metrics(&shared, Instant::now());
        assert!(body.contains("rtlite_msgs_received_total 5"));
        assert!(body.contains("rtlite_subscribed_names{topic=\"event\"} 0"));
        assert!(body.contains("# TYPE rtlite_clients_connected gauge"));
    }
}
