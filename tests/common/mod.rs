#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, stream};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use venuebook::tenant::TenantManager;
use venuebook::wire;

pub const PASSWORD: &str = "venuebook";

pub async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("venuebook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    (addr, tm)
}

pub async fn connect(addr: SocketAddr) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    connect_db(addr, "test").await
}

pub async fn connect_db(
    addr: SocketAddr,
    dbname: &str,
) -> (tokio_postgres::Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(dbname)
        .user("frontdesk")
        .password(PASSWORD);

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

/// Wait for a notification with timeout.
pub async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Data rows of a simple query.
pub async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

/// SQLSTATE of a failed statement.
pub async fn error_code(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.batch_execute(sql).await.expect_err("statement should fail");
    err.code().map(|c| c.code().to_string()).unwrap_or_default()
}

/// A café with three seats open 14:00-23:00 at 10.00 per seat-hour.
pub async fn create_cafe(client: &tokio_postgres::Client) -> Ulid {
    let rid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO resources (id, name, open, close, max_duration, price, sub_units) \
             VALUES ('{rid}', 'Cafe', '14:00', '23:00', 8, '10.00', 'C1,C2,C3')"
        ))
        .await
        .unwrap();
    rid
}

pub fn booking_sql(rid: Ulid, seats: &str, start: &str, hours: u32) -> String {
    format!(
        "INSERT INTO bookings (resource_id, sub_unit_ids, date, start, duration, customer_name, customer_email) \
         VALUES ('{rid}', '{seats}', '2025-06-01', '{start}', {hours}, 'Alice', 'alice@example.com')"
    )
}
