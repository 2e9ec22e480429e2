use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};

use reservd::tenant::TenantManager;
use reservd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, tempfile::TempDir) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let tm = Arc::new(TenantManager::new(dir.path().to_path_buf(), 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "reservd".to_string(), None).await;
            });
        }
    });

    (addr, dir)
}

async fn connect(addr: SocketAddr, db: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(db)
        .user("reservd")
        .password("reservd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn create_device(client: &Client, name: &str) -> String {
    let id = ulid::Ulid::new().to_string();
    client
        .simple_query(&format!(
            "INSERT INTO devices (id, name) VALUES ('{id}', '{name}')"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn overlapping_insert_is_exclusion_violation() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;
    let dev = create_device(&client, "scope-1").await;

    let inserted = rows(
        client
            .simple_query(&format!(
                r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{dev}', '2030-01-01T10:00:00Z', '2030-01-01T11:00:00Z')"#
            ))
            .await
            .unwrap(),
    );
    assert_eq!(inserted.len(), 1);
    assert_eq!(inserted[0].get("device_id"), Some(dev.as_str()));
    assert_eq!(inserted[0].get("start"), Some("2030-01-01T10:00:00.000Z"));
    assert_eq!(inserted[0].get("queued"), Some("f"));

    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{dev}', '2030-01-01T10:30:00Z', '2030-01-01T11:30:00Z')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::EXCLUSION_VIOLATION));

    // Touching the end is fine.
    client
        .simple_query(&format!(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{dev}', '2030-01-01T11:00:00Z', '2030-01-01T12:00:00Z')"#
        ))
        .await
        .unwrap();

    let listed = rows(
        client
            .simple_query(&format!("SELECT * FROM reservations WHERE device_id = '{dev}'"))
            .await
            .unwrap(),
    );
    assert_eq!(listed.len(), 2);
}

#[tokio::test]
async fn invalid_interval_and_unknown_device() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;
    let dev = create_device(&client, "scope-1").await;

    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{dev}', 2000, 1000)"#
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));

    let missing = ulid::Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{missing}', 1000, 2000)"#
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn queued_reservation_is_placed_and_current() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;
    let dev = create_device(&client, "rig").await;

    let placed = rows(
        client
            .simple_query(&format!(
                "INSERT INTO reservation_queue (device_id, simulation_time) VALUES ('{dev}', 60)"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].get("queued"), Some("t"));
    let id = placed[0].get("id").unwrap().to_string();

    // An empty device starts the queued run right away.
    let current = rows(
        client
            .simple_query("SELECT * FROM current_reservation")
            .await
            .unwrap(),
    );
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].get("id"), Some(id.as_str()));

    // The next request lands after the first one.
    let next = rows(
        client
            .simple_query(&format!(
                "INSERT INTO reservation_queue (device_id, simulation_time) VALUES ('{dev}', 60)"
            ))
            .await
            .unwrap(),
    );
    assert_eq!(next[0].get("start"), placed[0].get("end"));

    let err = client
        .simple_query(&format!(
            "INSERT INTO reservation_queue (device_id, simulation_time) VALUES ('{dev}', 0)"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_PARAMETER_VALUE));
}

#[tokio::test]
async fn no_current_reservation_is_not_found() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "empty").await;
    let err = client
        .simple_query("SELECT * FROM current_reservation")
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn update_and_delete_over_extended_protocol() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;
    let dev = create_device(&client, "rig").await;

    let inserted = client
        .query(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ($1, $2, $3)"#,
            &[&dev, &"2030-01-01 10:00:00+00:00", &"2030-01-01 11:00:00+00:00"],
        )
        .await
        .unwrap();
    assert_eq!(inserted.len(), 1);
    let id: String = inserted[0].get("id");

    let updated = client
        .query(
            r#"UPDATE reservations SET "end" = $1 WHERE id = $2"#,
            &[&"2030-01-01T12:00:00Z", &id],
        )
        .await
        .unwrap();
    let end: String = updated[0].get("end");
    assert_eq!(end, "2030-01-01T12:00:00.000Z");
    let start: String = updated[0].get("start");
    assert_eq!(start, "2030-01-01T10:00:00.000Z");

    let deleted = client
        .execute("DELETE FROM reservations WHERE id = $1", &[&id])
        .await
        .unwrap();
    assert_eq!(deleted, 1);

    let err = client
        .execute("DELETE FROM reservations WHERE id = $1", &[&id])
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::NO_DATA_FOUND));
}

#[tokio::test]
async fn device_type_in_use_cannot_be_deleted() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;

    let type_id = ulid::Ulid::new().to_string();
    client
        .simple_query(&format!(
            "INSERT INTO device_types (id, name) VALUES ('{type_id}', 'oscilloscope')"
        ))
        .await
        .unwrap();
    let dev = ulid::Ulid::new().to_string();
    client
        .simple_query(&format!(
            "INSERT INTO devices (id, name, device_type_id) VALUES ('{dev}', 'scope-1', '{type_id}')"
        ))
        .await
        .unwrap();

    let err = client
        .simple_query(&format!("DELETE FROM device_types WHERE id = '{type_id}'"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::FOREIGN_KEY_VIOLATION));

    client
        .simple_query(&format!(
            "UPDATE devices SET device_type_id = NULL WHERE id = '{dev}'"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!("DELETE FROM device_types WHERE id = '{type_id}'"))
        .await
        .unwrap();
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, _dir) = start_test_server().await;
    let a = connect(addr, "lab_a").await;
    let b = connect(addr, "lab_b").await;

    create_device(&a, "rig").await;
    assert_eq!(rows(a.simple_query("SELECT * FROM devices").await.unwrap()).len(), 1);
    assert!(rows(b.simple_query("SELECT * FROM devices").await.unwrap()).is_empty());
}

#[tokio::test]
async fn syntax_errors_report_sqlstate() {
    let (addr, _dir) = start_test_server().await;
    let client = connect(addr, "lab").await;

    let err = client.simple_query("SELEC nonsense").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (device_id, start, "end") VALUES ('{}', '2030-01-01 10:00', '2030-01-01 11:00')"#,
            ulid::Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::INVALID_DATETIME_FORMAT));
}
