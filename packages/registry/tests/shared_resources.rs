use std::sync::{Arc, Mutex};
use std::thread;

use capbridge_core::{Deadline, Value};
use capbridge_db::IsolationLevel;
use capbridge_registry::{Capability, CapabilityKind, CapabilityRegistry};
use serde_json::json;

#[test]
fn concurrent_resolves_build_one_resource() {
    let registry = Arc::new(CapabilityRegistry::default());
    let handles: Vec<Capability> = (0..8)
        .map(|_| {
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                registry
                    .resolve(CapabilityKind::Pipe, &json!({"name": "work"}))
                    .unwrap()
            })
        })
        .map(|t| t.join().unwrap())
        .collect();

    assert!(handles.windows(2).all(|w| w[0].same_resource(&w[1])));
    assert_eq!(registry.len(), 1);
}

#[test]
fn pipe_connects_producer_and_consumer() {
    let registry = Arc::new(CapabilityRegistry::default());

    let producer = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || {
            let pipe = registry.pipe("jobs").unwrap();
            for i in 0..5 {
                pipe.put(Value::from(i), &Deadline::from_timeout_ms(5_000)).unwrap();
            }
        })
    };

    let pipe = registry.pipe("jobs").unwrap();
    let mut received = Vec::new();
    while received.len() < 5 {
        received.extend(pipe.drain(10, &Deadline::from_timeout_ms(5_000)));
    }
    producer.join().unwrap();
    assert_eq!(received, (0..5).map(Value::from).collect::<Vec<_>>());
}

#[test]
fn event_bus_reaches_listeners_and_subscribers() {
    let registry = CapabilityRegistry::default();
    let bus = registry.event_bus("orders").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _listener = bus.on("created", move |v| sink.lock().unwrap().push(v.clone()));

    let same_bus = registry
        .resolve(CapabilityKind::EventBus, &json!({"name": "orders"}))
        .unwrap();
    let subscriber = same_bus.as_event_bus().unwrap().subscribe(["created"]);

    let delivery = bus.emit("created", Value::from("o-1"));
    assert_eq!(delivery.listeners, 1);
    assert_eq!(delivery.subscribers, 1);
    assert_eq!(subscriber.try_next(), Some(Value::from("o-1")));
    assert_eq!(*seen.lock().unwrap(), vec![Value::from("o-1")]);
}

#[test]
fn database_shared_by_connection_string() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");
    let config = json!({"driver": "sqlite3", "connection": path.to_str().unwrap()});

    let registry = CapabilityRegistry::default();
    let first = registry.resolve(CapabilityKind::Database, &config).unwrap();
    let second = registry.resolve(CapabilityKind::Database, &config).unwrap();
    assert!(first.same_resource(&second));

    let db = first.as_database().unwrap();
    let deadline = Deadline::from_timeout_ms(5_000);
    db.exec("CREATE TABLE t (v INTEGER)", &[], &deadline).unwrap();
    db.transaction(IsolationLevel::ReadCommitted, &deadline, |tx| {
        tx.exec("INSERT INTO t VALUES (1)", &[])?;
        tx.commit()
    })
    .unwrap();

    let rows = second
        .as_database()
        .unwrap()
        .query("SELECT v FROM t", &[], &deadline)
        .unwrap();
    assert_eq!(rows.len(), 1);
}
