//! The HTTP CONNECT tunnel: an HTTP port carrying the raw RPC stream.

mod common;

use std::sync::Arc;

use common::{arith_service, SumArgs};
use tinyrpc::{Client, Options, Server};
use tokio::net::TcpListener;

async fn spawn_http_server() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();
    tokio::spawn(server.serve_http(listener));
    addr
}

#[tokio::test(flavor = "multi_thread")]
async fn calls_flow_through_the_connect_tunnel() {
    let addr = spawn_http_server().await;
    let client = Client::x_dial(&format!("http@{addr}"), Options::default())
        .await
        .unwrap();
    let sum: i32 = client.call("Foo.Sum", &SumArgs::new(20, 22)).await.unwrap();
    assert_eq!(sum, 42);
}

#[tokio::test(flavor = "multi_thread")]
async fn non_connect_requests_get_405() {
    let addr = spawn_http_server().await;
    let resp = reqwest::get(format!("http://{addr}/_tinyrpc_")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test(flavor = "multi_thread")]
async fn malformed_addresses_are_rejected() {
    let err = Client::x_dial("localhost:5000", Options::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("expect protocol@addr"), "got: {err}");
}
