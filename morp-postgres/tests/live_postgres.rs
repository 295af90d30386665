//! Exercises `PostgresInterface` against a real Postgres server. Skipped
//! unless `TEST_DATABASE_URL` is set, since it needs a live database
//! (no mocking the driver, matching how the teacher's own `plane-tests`
//! suite runs against a real service rather than a stub).

use morp_core::config::{Backend, ConnectionConfig};
use morp_core::interface::Interface;
use morp_core::value::{Fields, FieldsExt, Value};
use morp_postgres::PostgresInterface;
use std::collections::HashMap;
use std::time::Duration;

fn config(dsn_path: &str) -> ConnectionConfig {
    // `dsn_path` is the raw DATABASE_URL; PostgresInterface only reads
    // the fields it needs off ConnectionConfig, so reconstruct one by
    // parsing it the same way the registry would.
    ConnectionConfig::parse(dsn_path).unwrap_or_else(|_| ConnectionConfig {
        name: String::new(),
        backend: Backend::Postgres,
        username: None,
        password: None,
        hosts: Vec::new(),
        path: String::new(),
        options: HashMap::new(),
        serializer: morp_core::codec::Serializer::Binary,
        key: None,
        max_timeout: 3600,
        backoff_multiplier: 1,
        backoff_amplifier: Some(1),
        min_size: 1,
        max_size: 5,
    })
}

#[tokio::test]
async fn round_trips_and_increments_delivery_count_on_release() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let cfg = config(&url);
    let iface = PostgresInterface::new(&cfg);
    iface.connect().await.unwrap();

    let queue = format!("verify_{}", std::process::id());
    iface.unsafe_delete(&queue).await.unwrap();

    let mut fields: Fields = HashMap::new();
    fields.insert("greeting".to_string(), Value::String("hi".to_string()));
    iface.send(&queue, fields, 0).await.unwrap();

    assert_eq!(iface.count(&queue).await.unwrap(), 1);

    let first = iface
        .recv(&queue, Duration::from_secs(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.get("greeting"), Some(&Value::String("hi".to_string())));
    assert_eq!(first.count(), 1);

    // release with an explicit delay so the test doesn't depend on the
    // DSN's backoff tuning (default multiplier/amplifier would push this
    // past a short recv timeout).
    iface.release(&queue, &first, Some(0)).await.unwrap();

    let second = iface
        .recv(&queue, Duration::from_secs(3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.count(), 2);

    iface.ack(&queue, &second).await.unwrap();
    assert_eq!(iface.count(&queue).await.unwrap(), 0);

    iface.unsafe_delete(&queue).await.unwrap();
}

#[tokio::test]
async fn concurrent_recv_never_double_claims_the_same_row() {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("skipping: TEST_DATABASE_URL not set");
        return;
    };

    let cfg = config(&url);
    let iface = std::sync::Arc::new(PostgresInterface::new(&cfg));
    iface.connect().await.unwrap();

    let queue = format!("verify_concurrent_{}", std::process::id());
    iface.unsafe_delete(&queue).await.unwrap();

    for n in 0..5 {
        let mut fields: Fields = HashMap::new();
        fields.insert("n".to_string(), Value::Int(n));
        iface.send(&queue, fields, 0).await.unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..5 {
        let iface = iface.clone();
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            iface
                .recv(&queue, Duration::from_secs(3))
                .await
                .unwrap()
                .unwrap()
        }));
    }

    let mut seen = std::collections::HashSet::new();
    for handle in handles {
        let fields = handle.await.unwrap();
        let n = fields.get("n").and_then(Value::as_i64).unwrap();
        assert!(seen.insert(n), "row {n} claimed more than once");
    }

    iface.unsafe_delete(&queue).await.unwrap();
}
