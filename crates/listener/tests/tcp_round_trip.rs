//! Drives a real listener over TCP through a two-phase remote pipeline.

use std::sync::Arc;

use listener::{NodeProvider, Reply, ReplyKind};
use nodes::{EndWithSuccess, Node};
use pipeline::{
    ComputationPhase, PhaseContext, PhaseError, PhaseOutput, Pipeline, PipelineError, Role,
};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

struct Collect;

impl ComputationPhase for Collect {
    fn compute(&mut self, ctx: &mut PhaseContext<'_>) -> Result<PhaseOutput, PhaseError> {
        Ok(PhaseOutput::new().with("sites", ctx.input().len() as u64))
    }
}

fn build(role: Role) -> Result<Node, PipelineError> {
    Ok(Node::new(
        Pipeline::builder(role)
            .phase("collect", || Collect)
            .phase("end", || EndWithSuccess)
            .build()?,
    ))
}

async fn start() -> std::net::SocketAddr {
    let socket = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let provider: NodeProvider = Arc::new(build);
    tokio::spawn(listener::run(socket, provider));
    addr
}

async fn exchange(
    lines: &mut tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    request: Value,
) -> Option<Reply> {
    let mut encoded = request.to_string();
    encoded.push('\n');
    writer.write_all(encoded.as_bytes()).await.unwrap();
    let line = lines.next_line().await.unwrap()?;
    Some(serde_json::from_str(&line).unwrap())
}

#[tokio::test]
async fn test_cache_round_trips_across_requests() {
    let addr = start().await;
    let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut lines = BufReader::new(reader).lines();

    let sites = json!({"site1": {}, "site2": {}});
    let first = exchange(
        &mut lines,
        &mut writer,
        json!({"mode": "remote", "data": {"input": sites, "state": {}, "cache": {}}}),
    )
    .await
    .unwrap();
    assert_eq!(first.kind, ReplyKind::Stdout);
    assert_eq!(first.data["output"]["sites"], json!(2));
    assert_eq!(first.data["success"], json!(false));

    let cache = first.data["cache"].clone();
    let second = exchange(
        &mut lines,
        &mut writer,
        json!({"mode": "remote", "data": {"input": sites, "state": {}, "cache": cache}}),
    )
    .await
    .unwrap();
    assert_eq!(second.kind, ReplyKind::Stdout);
    assert_eq!(second.data["success"], json!(true));
}

#[tokio::test]
async fn test_unknown_mode_gets_error_then_close() {
    let addr = start().await;
    let (reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
    let mut lines = BufReader::new(reader).lines();

    let reply = exchange(&mut lines, &mut writer, json!({"mode": "broker", "data": {}}))
        .await
        .unwrap();
    assert_eq!(reply.kind, ReplyKind::Stderr);
    assert!(lines.next_line().await.unwrap().is_none());
}
