//! Shared scaffolding for the end-to-end tests: the arithmetic test
//! service and a throwaway TCP server.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tinyrpc::{Server, Service};
use tokio::net::TcpListener;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SumArgs {
    pub num1: i32,
    pub num2: i32,
}

impl SumArgs {
    pub fn new(num1: i32, num2: i32) -> Self {
        Self { num1, num2 }
    }
}

/// `Foo.Sum` adds; `Foo.Sleep` blocks for `num1` seconds, then adds.
pub fn arith_service() -> Service {
    Service::build("Foo")
        .method("Sum", |args: SumArgs, reply: &mut i32| {
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .method("Sleep", |args: SumArgs, reply: &mut i32| {
            std::thread::sleep(Duration::from_secs(args.num1 as u64));
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .finish()
        .unwrap()
}

/// Spawn a server with the arithmetic service on an ephemeral port.
/// Returns its `host:port` address.
pub async fn spawn_server() -> (String, Arc<Server>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();
    tokio::spawn(server.clone().accept(listener));
    (addr, server)
}

pub fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
