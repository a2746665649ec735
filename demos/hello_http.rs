//! Minimal HTTP/1.0 responder.
//!
//! One request per connection: headers are buffered in a per-connection
//! session until the blank line, the response is rendered on the task runner,
//! written, and the connection is closed after the flush.
//!
//! ```bash
//! cargo run --example hello_http -- --port 8080
//! curl -v http://127.0.0.1:8080/hello
//! ```

use anyhow::Context;
use clap::Parser;
use mill_server::prelude::*;
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const MAX_HEAD: usize = 16 * 1024;

#[derive(Debug, Parser)]
#[command(name = "hello_http", about = "Single-shot HTTP responder on mill-server")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(short, long, default_value_t = 8080)]
    port: u16,

    #[arg(long, default_value_t = 2)]
    workers: usize,

    /// Seconds a client may take to send its request
    #[arg(long, default_value_t = 10)]
    request_timeout: u64,
}

struct Session {
    head: Mutex<Vec<u8>>,
    started: Instant,
}

struct HelloHttp {
    runner: TaskRunner,
    served: AtomicU64,
}

impl EventHandler for HelloHttp {
    fn on_create(&self, conn: &Arc<Connection>) -> HandlerResult {
        conn.set_user_context(Session {
            head: Mutex::new(Vec::new()),
            started: Instant::now(),
        });
        Ok(())
    }

    fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
        let Some(session) = conn.user_context::<Session>() else {
            return Ok(());
        };

        let head = {
            let mut head = session.head.lock();
            head.extend_from_slice(data);
            if head.len() > MAX_HEAD {
                return Err("request head too large".into());
            }
            match head.windows(4).position(|w| w == b"\r\n\r\n") {
                Some(end) => head[..end].to_vec(),
                None => return Ok(()),
            }
        };

        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        let task_conn = Arc::clone(conn);
        if let Err(e) = self.runner.push(move || respond(&task_conn, &head, served)) {
            warn!(conn = %conn.id(), error = %e, "runner rejected request");
            conn.write(b"HTTP/1.0 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n".to_vec())?;
            conn.close();
        }
        Ok(())
    }

    fn on_close(&self, conn: &Arc<Connection>) -> HandlerResult {
        if let Some(session) = conn.take_user_context::<Session>() {
            debug!(conn = %conn.id(), elapsed = ?session.started.elapsed(), "session finished");
        }
        Ok(())
    }
}

fn respond(conn: &Connection, head: &[u8], served: u64) {
    let head = String::from_utf8_lossy(head);
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = (parts.next().unwrap_or(""), parts.next().unwrap_or("/"));

    let (status, body) = match method {
        "GET" | "HEAD" => (
            "200 OK",
            format!("hello from {} (request #{served}, path {path})\n", conn.ip()),
        ),
        _ => ("405 Method Not Allowed", "method not allowed\n".to_string()),
    };

    let mut response = format!(
        "HTTP/1.0 {status}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )
    .into_bytes();
    if method != "HEAD" {
        response.extend_from_slice(body.as_bytes());
    }

    if conn.write(response).is_ok() {
        info!(conn = %conn.id(), %method, %path, status, "served");
    }
    conn.close();
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let runner = TaskRunner::with_policy(ScalingPolicy::default().with_queue_capacity(Some(1024)));
    runner.start(2, true).context("failed to start task runner")?;

    let config = TcpServerConfig::builder()
        .idle_timeout(Some(Duration::from_secs(args.request_timeout)))
        .build();
    let server = TcpServer::new(
        config,
        HelloHttp {
            runner,
            served: AtomicU64::new(0),
        },
    );
    let addr = server
        .start_on(&args.host, args.port, args.workers)
        .with_context(|| format!("failed to listen on {}:{}", args.host, args.port))?;
    info!(%addr, "http responder ready");

    std::thread::park();
    server.stop()?;
    server.handler().runner.stop(true);
    Ok(())
}
