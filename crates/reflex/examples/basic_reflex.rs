/// Basic Reflex Example
///
/// Wires the full pipeline against the in-memory backend: a resilient
/// connection, a schema-validated event mesh, and one materialized view,
/// then publishes a few change notifications and reads the view back.
///
/// Run with:
/// ```
/// cargo run --example basic_reflex
/// ```
use reflex::{ConnectionManager, EventMesh, MaterializedViewManager, MemoryBackend};
use reflex_core::{RawNotification, ReflexConfig, SchemaRule};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let backend = Arc::new(MemoryBackend::new());
    let config = ReflexConfig::builder()
        .credential_ref("/etc/reflex/service-account.json")
        .target("projects/demo")
        .build();

    let manager = ConnectionManager::connect(config, backend.clone()).await?;
    println!("Connected, state: {}", manager.state());

    let mesh = Arc::new(EventMesh::new());
    mesh.register_schema("order.created", SchemaRule::new().require("order_id"));

    let views = Arc::new(MaterializedViewManager::new());
    views.bind_view(
        "orders.by_id",
        ["order.created"],
        Arc::new(|value: Value, event| {
            let mut map = value.as_object().cloned().unwrap_or_default();
            if let Some(id) = event.field("order_id").and_then(Value::as_str) {
                map.insert(id.to_string(), Value::Object(event.payload.clone()));
            }
            Ok(Value::Object(map))
        }),
    );
    mesh.subscribe_boxed("order.created", views.clone().subscriber());

    // Attach the mesh to the change feed for one source path.
    let pump = {
        let mesh = mesh.clone();
        let manager = manager.clone();
        tokio::spawn(async move { mesh.run(&manager, "orders/incoming").await })
    };

    // Let the pump attach to the feed, then simulate the remote store
    // emitting changes.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for (seq, id) in [(1, "A1"), (2, "A2")] {
        backend
            .publish(
                "orders/incoming",
                RawNotification::new(
                    "orders/incoming",
                    json!({"type": "order.created", "payload": {"order_id": id}}),
                )
                .with_sequence(seq),
            )
            .await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let snapshot = views.read("orders.by_id").await?;
    println!(
        "View at marker {:?}: {}",
        snapshot.last_applied, snapshot.value
    );
    println!("Mesh stats: {:?}", mesh.stats());

    // Persist the view as a durability backstop, then shut down cleanly.
    views
        .persist("orders.by_id", &manager, "views/orders.by_id")
        .await?;
    pump.abort();
    manager.shutdown().await;

    Ok(())
}
