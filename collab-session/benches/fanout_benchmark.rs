use std::hint::black_box;
use std::sync::Arc;

use collab_session::protocol::{ClientEvent, ServerEvent};
use collab_session::SessionManager;
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

const OPERATION_FRAME: &str = r#"{"event":"operation","data":{"session_id":"doc-42","payload":{"content":"fn main() {\n    println!(\"hello\");\n}\n"}}}"#;

fn bench_client_decode(c: &mut Criterion) {
    c.bench_function("client_event_decode_operation", |b| {
        b.iter(|| {
            black_box(ClientEvent::decode(black_box(OPERATION_FRAME)).unwrap());
        })
    });

    let join = r#"{"event":"join-session","data":{"session_id":"doc-42","participant_id":"p-1","display_name":"Ada"}}"#;
    c.bench_function("client_event_decode_join", |b| {
        b.iter(|| {
            black_box(ClientEvent::decode(black_box(join)).unwrap());
        })
    });
}

fn bench_server_encode(c: &mut Criterion) {
    let event = ServerEvent::Cursor {
        session_id: "doc-42".into(),
        participant_id: "p-1".into(),
        position: json!({"lineNumber": 12, "column": 4}),
    };

    c.bench_function("server_event_encode_cursor", |b| {
        b.iter(|| {
            black_box(black_box(&event).encode().unwrap());
        })
    });
}

/// Relay one operation to a room of `size` connections.
fn bench_room_fanout(c: &mut Criterion, size: usize) {
    let rt = Runtime::new().unwrap();
    let manager = Arc::new(SessionManager::new(size));
    let mut inboxes = Vec::with_capacity(size);
    let mut sender = None;

    rt.block_on(async {
        for i in 0..size {
            let (tx, rx) = mpsc::channel(256);
            let conn = manager.connect(tx).await;
            manager
                .join("doc-42", &format!("p-{i}"), &format!("User {i}"), conn)
                .await
                .unwrap();
            sender.get_or_insert(conn);
            inboxes.push(rx);
        }
    });
    let sender = sender.unwrap();
    for rx in &mut inboxes {
        while rx.try_recv().is_ok() {}
    }

    let op = ClientEvent::decode(OPERATION_FRAME).unwrap();
    c.bench_function(&format!("room_fanout_{size}_peers"), |b| {
        b.iter(|| {
            rt.block_on(manager.dispatch(sender, black_box(op.clone()), None));
            for rx in &mut inboxes {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_fanout_10(c: &mut Criterion) {
    bench_room_fanout(c, 10);
}

fn bench_fanout_100(c: &mut Criterion) {
    bench_room_fanout(c, 100);
}

fn bench_join_leave(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let manager = SessionManager::new(100);
    let (tx, mut rx) = mpsc::channel(256);
    let conn = rt.block_on(manager.connect(tx));

    c.bench_function("join_then_leave", |b| {
        b.iter(|| {
            rt.block_on(async {
                manager.join("doc-1", "p-1", "Ada", conn).await.unwrap();
                manager.leave("doc-1", "p-1").await;
            });
            while rx.try_recv().is_ok() {}
        })
    });
}

criterion_group!(
    benches,
    bench_client_decode,
    bench_server_encode,
    bench_fanout_10,
    bench_fanout_100,
    bench_join_leave,
);
criterion_main!(benches);
