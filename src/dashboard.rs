//! Read-only web dashboard over the routing table.
//!
//! Renders a peer listing from table snapshots; it never mutates the table.

use crate::router::{PeerRecord, RoutingTable};
use anyhow::Result;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{error, info};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Serve the dashboard on `0.0.0.0:<port>`. Blocks; callers spawn it.
pub async fn serve(table: Arc<RoutingTable>, port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("dashboard listening on http://{}/", addr);

    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                error!("accept error: {}", e);
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let table = Arc::clone(&table);

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let table = Arc::clone(&table);
                handle_request(req, table)
            });

            let conn = hyper::server::conn::http1::Builder::new().serve_connection(io, service);

            if let Err(e) = conn.await {
                error!("connection error: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    table: Arc<RoutingTable>,
) -> Result<Response<String>, Infallible> {
    match req.uri().path() {
        "/" => Ok(Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/html; charset=utf-8")
            .body(render_peers(&table.snapshot()))
            .unwrap()),
        "/health" => Ok(Response::builder()
            .status(StatusCode::OK)
            .body("OK".to_string())
            .unwrap()),
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body("Not Found".to_string())
            .unwrap()),
    }
}

/// Liveness classification from the age of the last authenticated datagram.
fn classify(age: Duration) -> (&'static str, &'static str) {
    if age > Duration::from_secs(60) {
        ("Offline", "table-danger")
    } else if age > Duration::from_secs(25) {
        ("Idle", "table-warning")
    } else {
        ("Online", "table-success")
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!(
        "{:.1} {}B",
        bytes as f64 / div as f64,
        ['K', 'M', 'G', 'T', 'P', 'E'][exp]
    )
}

fn render_peers(peers: &[PeerRecord]) -> String {
    let mut rows = String::new();
    for peer in peers {
        let age = peer.last_seen.elapsed();
        let (status, row_class) = classify(age);
        rows.push_str(&format!(
            "<tr class=\"{row_class}\">\
             <td class=\"fw-bold\">{}</td>\
             <td>{}</td>\
             <td><span class=\"badge bg-secondary\">{status}</span></td>\
             <td>{}s ago</td>\
             <td>{}</td>\
             <td>{}</td>\
             </tr>\n",
            peer.overlay_ip,
            peer.endpoint,
            age.as_secs(),
            format_bytes(peer.rx_bytes),
            format_bytes(peer.tx_bytes),
        ));
    }

    let body = if peers.is_empty() {
        "<div class=\"text-center text-muted py-4\">No peers yet. Waiting for registrations.</div>"
            .to_string()
    } else {
        format!(
            "<table class=\"table table-hover align-middle\">\
             <thead class=\"table-light\"><tr>\
             <th>Overlay IP</th><th>Real Address (WAN)</th><th>Status</th>\
             <th>Last Seen</th><th>Data In (Rx)</th><th>Data Out (Tx)</th>\
             </tr></thead><tbody>\n{rows}</tbody></table>"
        )
    };

    format!(
        "<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n\
         <meta charset=\"UTF-8\">\n\
         <meta http-equiv=\"refresh\" content=\"3\">\n\
         <title>Overlay Dashboard</title>\n\
         <link href=\"https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css\" rel=\"stylesheet\">\n\
         <style>body {{ background-color: #f0f2f5; padding-top: 30px; }}\
         .card {{ border: none; box-shadow: 0 4px 6px rgba(0,0,0,0.1); }}</style>\n\
         </head>\n<body>\n<div class=\"container\"><div class=\"card\">\n\
         <div class=\"card-header bg-dark text-white p-3\"><h4 class=\"mb-0\">Overlay Hub</h4></div>\n\
         <div class=\"card-body\">{body}</div>\n\
         <div class=\"card-footer text-muted text-end\"><small>Auto-refreshing</small></div>\n\
         </div></div>\n</body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Instant;

    #[test]
    fn liveness_thresholds() {
        assert_eq!(classify(Duration::from_secs(0)).0, "Online");
        assert_eq!(classify(Duration::from_secs(25)).0, "Online");
        assert_eq!(classify(Duration::from_secs(26)).0, "Idle");
        assert_eq!(classify(Duration::from_secs(60)).0, "Idle");
        assert_eq!(classify(Duration::from_secs(61)).0, "Offline");
    }

    #[test]
    fn byte_formatting() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.0 MB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.0 GB");
    }

    #[test]
    fn render_lists_each_peer() {
        let peers = vec![PeerRecord {
            overlay_ip: Ipv4Addr::new(10, 0, 0, 2),
            endpoint: "203.0.113.9:45678".parse().unwrap(),
            last_seen: Instant::now(),
            rx_bytes: 2048,
            tx_bytes: 10,
        }];

        let html = render_peers(&peers);
        assert!(html.contains("10.0.0.2"));
        assert!(html.contains("203.0.113.9:45678"));
        assert!(html.contains("Online"));
        assert!(html.contains("2.0 KB"));
        assert!(html.contains("10 B"));
    }

    #[test]
    fn render_empty_table_shows_placeholder() {
        let html = render_peers(&[]);
        assert!(html.contains("No peers yet"));
    }
}
