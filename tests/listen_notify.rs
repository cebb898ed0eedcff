use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use slotline::config::EngineSettings;
use slotline::tenant::TenantManager;
use slotline::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("slotline_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, EngineSettings::default()));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "slotline".to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

async fn connect_to(
    addr: SocketAddr,
    dbname: &str,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("slotline")
        .password("slotline");

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    connect_to(addr, "test").await
}

async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Notifications reach a listener at its next command, so give it one.
async fn poll(client: &tokio_postgres::Client) {
    client.simple_query("SELECT * FROM resources").await.unwrap();
}

async fn create_resource(client: &tokio_postgres::Client, capacity: u32) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, capacity) VALUES ('{rid}', {capacity})"
        ))
        .await
        .unwrap();
    rid
}

/// First data row of a simple query as `(column, value)` lookups.
async fn first_row(client: &tokio_postgres::Client, sql: &str) -> Vec<(String, Option<String>)> {
    let messages = client.simple_query(sql).await.unwrap();
    for msg in messages {
        if let SimpleQueryMessage::Row(row) = msg {
            return row
                .columns()
                .iter()
                .enumerate()
                .map(|(i, c)| (c.name().to_string(), row.get(i).map(str::to_string)))
                .collect();
        }
    }
    panic!("no rows returned for {sql}");
}

fn column<'a>(row: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    row.iter()
        .find(|(c, _)| c == name)
        .and_then(|(_, v)| v.as_deref())
}

async fn join(client: &tokio_postgres::Client, rid: Ulid, actor: &str) -> Vec<(String, Option<String>)> {
    first_row(
        client,
        &format!("INSERT INTO reservations (resource_id, actor_id) VALUES ('{rid}', '{actor}')"),
    )
    .await
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn connect_and_query() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    let rid = create_resource(&client, 3).await;
    let row = first_row(&client, "SELECT * FROM resources").await;
    assert_eq!(column(&row, "id"), Some(rid.to_string().as_str()));
    assert_eq!(column(&row, "capacity"), Some("3"));
    assert_eq!(column(&row, "available"), Some("3"));
    assert_eq!(column(&row, "name"), None);
}

#[tokio::test]
async fn join_reports_outcome_and_position() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_resource(&client, 1).await;

    let row = join(&client, rid, "alice").await;
    assert_eq!(column(&row, "outcome"), Some("joined"));
    assert_eq!(column(&row, "position"), None);

    let row = join(&client, rid, "bob").await;
    assert_eq!(column(&row, "outcome"), Some("waitlisted"));
    assert_eq!(column(&row, "position"), Some("1"));

    let row = first_row(
        &client,
        &format!("SELECT * FROM waitlist WHERE resource_id = '{rid}'"),
    )
    .await;
    assert_eq!(column(&row, "actor_id"), Some("bob"));
    assert_eq!(column(&row, "state"), Some("waiting"));
}

#[tokio::test]
async fn leave_promotes_and_confirm_takes_slot() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_resource(&client, 1).await;
    join(&client, rid, "alice").await;
    join(&client, rid, "bob").await;

    client
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    let row = first_row(
        &client,
        &format!("SELECT * FROM waitlist WHERE resource_id = '{rid}'"),
    )
    .await;
    assert_eq!(column(&row, "state"), Some("notified"));
    assert!(column(&row, "expires_at").is_some());

    let row = first_row(
        &client,
        &format!("INSERT INTO confirmations (resource_id, actor_id) VALUES ('{rid}', 'bob')"),
    )
    .await;
    assert_eq!(column(&row, "outcome"), Some("confirmed"));

    let messages = client
        .simple_query(&format!(
            "SELECT * FROM reservations WHERE resource_id = '{rid}'"
        ))
        .await
        .unwrap();
    let states: Vec<String> = messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get("state").map(str::to_string),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec!["released", "confirmed"]);
}

#[tokio::test]
async fn domain_errors_carry_sqlstate() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    let rid = create_resource(&client, 1).await;

    let err = client
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'ghost'"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    let err = client
        .batch_execute(&format!(
            "INSERT INTO waitlist (resource_id, actor_id) VALUES ('{rid}', 'early')"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));

    let err = client.batch_execute("SELECT * FROM waitlist").await.unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::SYNTAX_ERROR));

    // The connection survives errors
    poll(&client).await;
}

#[tokio::test]
async fn tenants_are_isolated_by_database() {
    let (addr, tm) = start_test_server().await;
    let (client_a, _) = connect_to(addr, "tenant_a").await;
    let (client_b, _) = connect_to(addr, "tenant_b").await;

    let rid = create_resource(&client_a, 1).await;
    let messages = client_b.simple_query("SELECT * FROM resources").await.unwrap();
    assert!(
        !messages
            .iter()
            .any(|m| matches!(m, SimpleQueryMessage::Row(_)))
    );
    let err = client_b
        .batch_execute(&format!(
            "INSERT INTO reservations (resource_id, actor_id) VALUES ('{rid}', 'a')"
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(&SqlState::RAISE_EXCEPTION));
    assert_eq!(tm.len(), 2);
}

#[tokio::test]
async fn listen_receives_promotion() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (actor, _) = connect(addr).await;

    let rid = create_resource(&actor, 1).await;
    join(&actor, rid, "alice").await;
    join(&actor, rid, "bob").await;

    listener
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();

    actor
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    poll(&listener).await;

    let notif = recv_notification(&mut rx, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("resource_{rid}"));

    let payload: serde_json::Value = serde_json::from_str(notif.payload()).unwrap();
    assert_eq!(payload["event"], "promoted");
    assert_eq!(payload["actor_id"], "bob");
    assert_eq!(payload["resource_id"], rid.to_string());
    assert!(payload["expires_at"].is_i64());
}

#[tokio::test]
async fn notification_only_on_subscribed_resource() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (actor, _) = connect(addr).await;

    let rid_a = create_resource(&actor, 1).await;
    let rid_b = create_resource(&actor, 1).await;
    for rid in [rid_a, rid_b] {
        join(&actor, rid, "alice").await;
        join(&actor, rid, "bob").await;
    }
    listener
        .batch_execute(&format!("LISTEN resource_{rid_a}"))
        .await
        .unwrap();

    actor
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid_b}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    poll(&listener).await;
    let notif = recv_notification(&mut rx, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notification for unsubscribed resource");

    actor
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid_a}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    poll(&listener).await;
    let notif = recv_notification(&mut rx, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "should receive notification for subscribed resource");
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let rid = create_resource(&listener, 1).await;
    join(&listener, rid, "alice").await;
    join(&listener, rid, "bob").await;

    listener
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();

    // Leaving on the listening connection delivers at the same command
    listener
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();

    assert!(recv_notification(&mut rx, Duration::from_secs(5)).await.is_some());
    poll(&listener).await;
    assert!(
        recv_notification(&mut rx, Duration::from_millis(300))
            .await
            .is_none(),
        "should not receive duplicate notification"
    );
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (actor, _) = connect(addr).await;
    let rid = create_resource(&actor, 1).await;
    join(&actor, rid, "alice").await;
    join(&actor, rid, "bob").await;

    listener
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();
    listener
        .batch_execute(&format!("UNLISTEN resource_{rid}"))
        .await
        .unwrap();

    actor
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    poll(&listener).await;

    let notif = recv_notification(&mut rx, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notification after UNLISTEN");
}

#[tokio::test]
async fn unlisten_all_stops_everything() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (actor, _) = connect(addr).await;

    let rids = [create_resource(&actor, 1).await, create_resource(&actor, 1).await];
    for rid in rids {
        join(&actor, rid, "alice").await;
        join(&actor, rid, "bob").await;
        listener
            .batch_execute(&format!("LISTEN resource_{rid}"))
            .await
            .unwrap();
    }
    listener.batch_execute("UNLISTEN *").await.unwrap();

    for rid in rids {
        actor
            .batch_execute(&format!(
                "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
            ))
            .await
            .unwrap();
    }
    poll(&listener).await;

    let notif = recv_notification(&mut rx, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn listen_rejects_bad_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;
    assert!(client.batch_execute("LISTEN bookings").await.is_err());
    assert!(client.batch_execute("LISTEN resource_nope").await.is_err());
}

#[tokio::test]
async fn multiple_events_on_same_channel() {
    let (addr, _tm) = start_test_server().await;
    let (listener, mut rx) = connect(addr).await;
    let (actor, _) = connect(addr).await;
    let rid = create_resource(&actor, 1).await;
    join(&actor, rid, "alice").await;
    join(&actor, rid, "bob").await;
    join(&actor, rid, "carol").await;

    listener
        .batch_execute(&format!("LISTEN resource_{rid}"))
        .await
        .unwrap();

    // promoted(bob), then bob withdraws so carol is promoted, then carol confirms
    actor
        .batch_execute(&format!(
            "DELETE FROM reservations WHERE resource_id = '{rid}' AND actor_id = 'alice'"
        ))
        .await
        .unwrap();
    actor
        .batch_execute(&format!(
            "DELETE FROM waitlist WHERE resource_id = '{rid}' AND actor_id = 'bob'"
        ))
        .await
        .unwrap();
    actor
        .batch_execute(&format!(
            "INSERT INTO confirmations (resource_id, actor_id) VALUES ('{rid}', 'carol')"
        ))
        .await
        .unwrap();
    poll(&listener).await;

    let mut events = Vec::new();
    while let Some(n) = recv_notification(&mut rx, Duration::from_secs(2)).await {
        let payload: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
        events.push(format!("{}:{}", payload["event"].as_str().unwrap(), payload["actor_id"].as_str().unwrap()));
        if events.len() == 3 {
            break;
        }
    }
    assert_eq!(
        events,
        vec!["promoted:bob", "promoted:carol", "confirmed:carol"]
    );
}
