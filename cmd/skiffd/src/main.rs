//! # skiffd: static HTTP server daemon
//!
//! One reactor thread on epoll, a fixed worker pool for connection
//! cycles, min-heap idle eviction, memory-mapped file bodies.
//!
//! ## Usage
//!
//!     skiffd [--port 8080] [--workers 6] [--root ./resources]
//!            [--timeout 60000] [--trig-mode 3] [--max-conns 65536]
//!            [--linger] [--quiet] [--log-level 1]
//!
//! Every flag also has a `SKIFF_*` environment variable; flags win.

mod logger;

use std::sync::Arc;
use std::sync::OnceLock;

use nix::sys::signal::{signal, SigHandler, Signal};

use skiff_http::MemoryCredentials;
use skiff_server::{Server, ServerConfig, ServerHandle};

static HANDLE: OnceLock<ServerHandle> = OnceLock::new();

extern "C" fn handle_shutdown(_sig: libc::c_int) {
    // Only an atomic store and an eventfd write; safe in a handler.
    if let Some(handle) = HANDLE.get() {
        handle.stop();
    }
}

fn usage() -> ! {
    eprintln!(
        "usage: skiffd [options]\n\
         \n\
         options:\n\
           -p, --port <n>        listen port (default 8080)\n\
           -w, --workers <n>     worker threads (default 6)\n\
           -r, --root <dir>      document root (default ./resources)\n\
               --timeout <ms>    idle timeout, 0 disables (default 60000)\n\
               --trig-mode <0-3> level/edge matrix (default 3)\n\
               --max-conns <n>   connection-table capacity\n\
               --linger          graceful linger on the listener\n\
               --quiet           disable logging\n\
               --log-level <0-3> 0=debug 1=info 2=warn 3=error\n\
               --log-queue <n>   async log queue depth\n\
           -h, --help            this text"
    );
    std::process::exit(1);
}

fn parse_args(mut config: ServerConfig) -> ServerConfig {
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;
    while i < args.len() {
        let mut value = |i: &mut usize| -> String {
            *i += 1;
            args.get(*i).cloned().unwrap_or_else(|| usage())
        };
        match args[i].as_str() {
            "--port" | "-p" => {
                config.port = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--workers" | "-w" => {
                config.workers = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--root" | "-r" => {
                config.doc_root = value(&mut i);
            }
            "--timeout" => {
                config.timeout_ms = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--trig-mode" => {
                config.trig_mode = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--max-conns" => {
                config.max_connections = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--linger" => config.linger = true,
            "--quiet" => config.log_enabled = false,
            "--log-level" => {
                config.log_level = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--log-queue" => {
                config.log_queue_depth = value(&mut i).parse().unwrap_or_else(|_| usage());
            }
            "--help" | "-h" => usage(),
            other => {
                eprintln!("skiffd: unknown option {:?}", other);
                usage();
            }
        }
        i += 1;
    }
    config
}

fn main() {
    let config = parse_args(ServerConfig::from_env());

    if config.log_enabled {
        logger::init(logger::level_filter(config.log_level), config.log_queue_depth);
    }

    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigIgn);
        let _ = signal(Signal::SIGINT, SigHandler::Handler(handle_shutdown));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(handle_shutdown));
    }

    let credentials = Arc::new(MemoryCredentials::with_capacity(config.credential_slots));
    let mut server = match Server::new(config, credentials) {
        Ok(server) => server,
        Err(err) => {
            eprintln!("skiffd: {}", err);
            std::process::exit(1);
        }
    };
    let _ = HANDLE.set(server.handle());

    log::info!("skiffd listening on http://0.0.0.0:{}/", server.port());
    server.run();
    log::info!("skiffd exited cleanly");
}
