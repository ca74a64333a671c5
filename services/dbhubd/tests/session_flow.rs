//! End-to-end session tests: a real `Server`, a real `TcpListener`, and
//! `test-support::TestClient` driving the wire protocol exactly as a peer
//! would, exercising the literal scenarios the specification calls out
//! (list/get_schema, transact+monitor snapshot/delta, lock/steal/unlock).

use std::sync::Arc;

use db_core::Database;
use dbhubd::server::Server;
use dbhubd::session::{Backlog, Session};
use serde_json::json;
use test_support::TestClient;
use tokio::net::TcpListener;
use wire_protocol::methods;

async fn spawn_test_server() -> (Arc<Server>, std::net::SocketAddr) {
    let server = Arc::new(Server::new(16, "status".to_owned(), "remote_status".to_owned()));
    let db: Arc<dyn Database> = Arc::new(db_core::mem::MemDatabase::new("main"));
    server.add_database("main".to_owned(), db).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept_server = Arc::clone(&server);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let server = Arc::clone(&accept_server);
            tokio::spawn(async move {
                let id = server.alloc_session_id();
                let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
                let session = Session::new(id, Arc::clone(&server), Arc::clone(&server.databases), Arc::clone(&server.locks), tx, Arc::new(Backlog::default()));
                session.run(stream).await;
            });
        }
    });

    (server, addr)
}

#[tokio::test]
async fn list_dbs_and_get_schema_round_trip() {
    let (_server, addr) = spawn_test_server().await;
    let mut client = TestClient::connect(addr).await.unwrap();

    client.request(json!(1), methods::LIST_DBS, vec![]).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.result, Some(json!(["main"])));

    client.request(json!(2), methods::GET_SCHEMA, vec![json!("main")]).await.unwrap();
    let reply = client.recv().await.unwrap();
    assert_eq!(reply.result, Some(json!({ "tables": [] })));
}

#[tokio::test]
async fn transact_insert_is_observed_through_monitor_snapshot_and_delta() {
    let (_server, addr) = spawn_test_server().await;
    let mut client = TestClient::connect(addr).await.unwrap();

    let spec = json!({ "widgets": { "columns": ["name"] } });
    client.request(json!(1), methods::MONITOR, vec![json!("main"), json!("mon1"), spec]).await.unwrap();
    let snapshot = client.recv().await.unwrap();
    assert_eq!(snapshot.result, Some(json!({})));

    let insert = json!({ "op": "insert", "table": "widgets", "row": { "name": "a" } });
    client.request(json!(2), methods::TRANSACT, vec![json!("main"), insert]).await.unwrap();
    let transact_reply = client.recv().await.unwrap();
    assert!(transact_reply.error.is_none());

    let update = client.recv().await.unwrap();
    assert_eq!(update.method.as_deref(), Some(methods::UPDATE));
    let params = update.params.unwrap();
    assert_eq!(params[0], json!("mon1"));
    let table_delta = &params[1]["widgets"];
    let row = table_delta.as_object().unwrap().values().next().unwrap();
    assert_eq!(row["new"]["name"], json!("a"));
}

#[tokio::test]
async fn lock_wait_then_steal_notifies_the_original_owner() {
    let (_server, addr) = spawn_test_server().await;
    let mut owner = TestClient::connect(addr).await.unwrap();
    let mut thief = TestClient::connect(addr).await.unwrap();

    owner.request(json!(1), methods::LOCK, vec![json!("L")]).await.unwrap();
    let reply = owner.recv().await.unwrap();
    assert_eq!(reply.result, Some(json!({ "locked": true })));

    thief.request(json!(1), methods::STEAL, vec![json!("L")]).await.unwrap();
    let reply = thief.recv().await.unwrap();
    assert_eq!(reply.result, Some(json!({ "locked": true })));

    let stolen = owner.recv().await.unwrap();
    assert_eq!(stolen.method.as_deref(), Some(methods::STOLEN));
}

#[tokio::test]
async fn reusing_a_pending_transact_id_is_rejected() {
    let (_server, addr) = spawn_test_server().await;
    let mut client = TestClient::connect(addr).await.unwrap();

    let op = json!({ "op": "insert", "table": "widgets", "row": { "name": "b" } });
    client.request(json!(42), methods::TRANSACT, vec![json!("main"), op.clone()]).await.unwrap();
    client.request(json!(42), methods::TRANSACT, vec![json!("main"), op]).await.unwrap();

    let first_reply = client.recv().await.unwrap();
    assert_eq!(first_reply.error, Some(json!("duplicate request ID")));
}
