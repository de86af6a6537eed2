use criterion::{black_box, criterion_group, criterion_main, Criterion};
use schemaflow_collab::presence::CursorPosition;
use schemaflow_collab::protocol::{
    ChangeKind, CursorFrame, JoinRequest, Message, SchemaChange, User,
};
use schemaflow_collab::registry::Hub;
use schemaflow_collab::service::transform_operation;
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc;

fn cursor_message() -> Message {
    Message::CursorUpdate(CursorFrame {
        user_id: "u1".into(),
        position: CursorPosition {
            x: 412.5,
            y: 108.0,
            table_id: Some("t1".into()),
            column_id: Some("c3".into()),
        },
        timestamp: Utc::now(),
    })
}

fn schema_change_message() -> Message {
    Message::SchemaChange(SchemaChange {
        kind: ChangeKind::TableUpdated,
        data: json!({
            "tableId": "t1",
            "name": "orders",
            "columns": ["id", "customer_id", "total", "created_at"],
            "position": {"x": 120, "y": 340}
        }),
        user_id: "u1".into(),
        timestamp: Utc::now(),
    })
}

fn bench_cursor_encode(c: &mut Criterion) {
    let msg = cursor_message();
    c.bench_function("cursor_update_encode", |b| {
        b.iter(|| black_box(black_box(&msg).encode().unwrap()))
    });
}

fn bench_cursor_decode(c: &mut Criterion) {
    let encoded = cursor_message().encode().unwrap();
    c.bench_function("cursor_update_decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_schema_change_roundtrip(c: &mut Criterion) {
    let msg = schema_change_message();
    c.bench_function("schema_change_roundtrip", |b| {
        b.iter(|| {
            let encoded = black_box(&msg).encode().unwrap();
            black_box(Message::decode(&encoded).unwrap());
        })
    });
}

fn bench_transform_operation(c: &mut Criterion) {
    let a = SchemaChange {
        kind: ChangeKind::TableUpdated,
        data: json!({"tableId": "t1", "name": "orders", "color": "blue"}),
        user_id: "u1".into(),
        timestamp: Utc::now(),
    };
    let b_change = SchemaChange {
        kind: ChangeKind::TableUpdated,
        data: json!({"tableId": "t1", "name": "invoices", "pinned": true}),
        user_id: "u2".into(),
        timestamp: Utc::now(),
    };
    c.bench_function("transform_operation_merge", |b| {
        b.iter(|| black_box(transform_operation(black_box(&a), black_box(&b_change))))
    });
}

fn bench_room_fanout_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let (hub, sender, mut receivers) = rt.block_on(async {
        let hub = Hub::new();
        let mut receivers = Vec::new();
        let mut sender = None;
        for n in 0..100 {
            let (tx, rx) = mpsc::unbounded_channel();
            let conn = hub.register(tx).await;
            hub.handle_message(
                conn,
                Message::UserJoin(JoinRequest {
                    user: User::new(format!("u{n}"), format!("user{n}"), "editor"),
                    schema_id: "s1".into(),
                }),
            )
            .await;
            if n == 0 {
                sender = Some(conn);
            }
            receivers.push(rx);
        }
        (hub, sender.unwrap(), receivers)
    });

    let msg = cursor_message();
    c.bench_function("room_fanout_100_peers", |b| {
        b.iter(|| {
            rt.block_on(hub.handle_message(sender, msg.clone()));
            for rx in &mut receivers {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

criterion_group!(
    benches,
    bench_cursor_encode,
    bench_cursor_decode,
    bench_schema_change_roundtrip,
    bench_transform_operation,
    bench_room_fanout_100_peers,
);
criterion_main!(benches);
