//! Line echo server.
//!
//! Each worker accumulates bytes per connection until a newline, then hands
//! the complete line to the task runner, which writes the reply back through
//! the connection from a pool thread.
//!
//! ```bash
//! cargo run --example echo_server -- --addr 127.0.0.1:7000 --workers 4
//! printf 'hello\nquit\n' | nc 127.0.0.1 7000
//! ```

use anyhow::Context;
use clap::Parser;
use mill_server::prelude::*;
use parking_lot::Mutex;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "echo_server", about = "Line echo server on mill-server")]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7000")]
    addr: SocketAddr,

    /// Number of worker loops
    #[arg(long, default_value_t = mill_server::default_worker_count())]
    workers: usize,

    /// Minimum pool threads kept alive
    #[arg(long, default_value_t = 2)]
    min_tasks: usize,

    /// Close connections idle for this many seconds (0 disables)
    #[arg(long, default_value_t = 30)]
    idle_secs: u64,
}

/// Bytes received since the last newline.
#[derive(Default)]
struct LineBuffer(Mutex<Vec<u8>>);

struct LineEcho {
    runner: Arc<TaskRunner>,
}

impl EventHandler for LineEcho {
    fn on_create(&self, conn: &Arc<Connection>) -> HandlerResult {
        info!(conn = %conn.id(), peer = %conn.peer_addr(), "client connected");
        conn.set_user_context(LineBuffer::default());
        conn.write(b"welcome, send `quit` to leave\n".to_vec())?;
        Ok(())
    }

    fn on_read(&self, conn: &Arc<Connection>, data: &[u8]) -> HandlerResult {
        let Some(buffer) = conn.user_context::<LineBuffer>() else {
            return Err("connection has no line buffer".into());
        };

        let lines: Vec<Vec<u8>> = {
            let mut pending = buffer.0.lock();
            pending.extend_from_slice(data);
            let mut lines = Vec::new();
            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                lines.push(pending.drain(..=pos).collect());
            }
            lines
        };

        for line in lines {
            let conn = Arc::clone(conn);
            self.runner.push(move || reply(&conn, &line))?;
        }
        Ok(())
    }

    fn on_close(&self, conn: &Arc<Connection>) -> HandlerResult {
        info!(conn = %conn.id(), "client disconnected");
        Ok(())
    }

    fn on_error(&self, conn_id: ConnectionId, message: &str) {
        warn!(conn = %conn_id, "{message}");
    }
}

fn reply(conn: &Connection, line: &[u8]) {
    let text = String::from_utf8_lossy(line);
    if text.trim_end() == "quit" {
        let _ = conn.write(b"bye\n".to_vec());
        conn.close();
        return;
    }
    if let Err(e) = conn.write(line.to_vec()) {
        warn!(conn = %conn.id(), error = %e, "reply dropped");
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_thread_names(true)
        .init();

    let args = Args::parse();

    let runner = Arc::new(TaskRunner::new(32));
    runner
        .start(args.min_tasks, true)
        .context("failed to start task runner")?;

    let idle_timeout = (args.idle_secs > 0).then(|| Duration::from_secs(args.idle_secs));
    let config = TcpServerConfig::builder()
        .address(args.addr)
        .workers(args.workers)
        .idle_timeout(idle_timeout)
        .build();

    let server = TcpServer::new(
        config,
        LineEcho {
            runner: Arc::clone(&runner),
        },
    );
    let addr = server.start().context("failed to start server")?;
    info!(%addr, workers = server.ready_workers(), "echo server ready");

    loop {
        std::thread::sleep(Duration::from_secs(10));
        info!(
            connections = server.connection_count(),
            pool = runner.worker_count(),
            busy = runner.busy_workers(),
            queued = runner.queued(),
            "stats"
        );
    }
}
