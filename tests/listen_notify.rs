mod common;

use std::time::Duration;

use ulid::Ulid;

use common::*;

// Notifications ride ahead of the listener's next response, so each test
// pokes the listening connection with a cheap query before waiting.
async fn poke(client: &tokio_postgres::Client) {
    client.simple_query("SELECT * FROM resources").await.unwrap();
}

#[tokio::test]
async fn listen_receives_booking_notification() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid = create_cafe(&client1).await;

    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();

    let (client2, _rx2) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid, "C1", "18:00", 2)).await.unwrap();

    poke(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5))
        .await
        .expect("expected notification");
    assert_eq!(notif.channel(), format!("resource_{rid}"));

    let parsed: serde_json::Value =
        serde_json::from_str(notif.payload()).expect("notification payload should be valid JSON");
    let booking = &parsed["BookingCreated"]["booking"];
    assert_eq!(booking["resource_id"], rid.to_string());
    assert_eq!(booking["sub_unit_ids"][0], "C1");
}

#[tokio::test]
async fn notification_only_on_subscribed_resource() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid_a = create_cafe(&client1).await;
    let rid_b = create_cafe(&client1).await;

    client1.batch_execute(&format!("LISTEN resource_{rid_a}")).await.unwrap();

    let (client2, _) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid_b, "C1", "18:00", 1)).await.unwrap();

    poke(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notification for unsubscribed resource");

    client2.batch_execute(&booking_sql(rid_a, "C1", "18:00", 1)).await.unwrap();

    poke(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(notif.is_some(), "should receive notification for subscribed resource");
}

#[tokio::test]
async fn listen_duplicate_is_idempotent() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid = create_cafe(&client1).await;

    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();
    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();

    let (client2, _) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid, "C2", "15:00", 1)).await.unwrap();

    poke(&client1).await;
    let first = recv_notification(&mut rx1, Duration::from_secs(5)).await;
    assert!(first.is_some(), "should receive one notification");

    poke(&client1).await;
    let second = recv_notification(&mut rx1, Duration::from_millis(300)).await;
    assert!(second.is_none(), "should not receive duplicate notification");
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid = create_cafe(&client1).await;

    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();
    client1.batch_execute(&format!("UNLISTEN resource_{rid}")).await.unwrap();

    let (client2, _) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid, "C1", "18:00", 1)).await.unwrap();

    poke(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notification after UNLISTEN");
}

#[tokio::test]
async fn unlisten_all_stops_everything() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid_a = create_cafe(&client1).await;
    let rid_b = create_cafe(&client1).await;

    client1.batch_execute(&format!("LISTEN resource_{rid_a}")).await.unwrap();
    client1.batch_execute(&format!("LISTEN resource_{rid_b}")).await.unwrap();
    client1.batch_execute("UNLISTEN *").await.unwrap();

    let (client2, _) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid_a, "C1", "18:00", 1)).await.unwrap();
    client2.batch_execute(&booking_sql(rid_b, "C1", "18:00", 1)).await.unwrap();

    poke(&client1).await;
    let notif = recv_notification(&mut rx1, Duration::from_millis(300)).await;
    assert!(notif.is_none(), "should not receive notifications after UNLISTEN *");
}

#[tokio::test]
async fn status_and_payment_changes_are_published() {
    let (addr, _tm) = start_test_server().await;
    let (client1, mut rx1) = connect(addr).await;
    let rid = create_cafe(&client1).await;
    let bid = Ulid::new();
    client1
        .batch_execute(&format!(
            "INSERT INTO bookings (id, resource_id, sub_unit_ids, date, start, duration, customer_name, customer_email) \
             VALUES ('{bid}', '{rid}', 'C3', '2025-06-01', '20:00', 1, 'Bob', 'bob@example.com')"
        ))
        .await
        .unwrap();
    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();

    let (client2, _) = connect(addr).await;
    client2
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{bid}'"))
        .await
        .unwrap();
    client2
        .batch_execute(&format!("UPDATE bookings SET payment_status = 'completed' WHERE id = '{bid}'"))
        .await
        .unwrap();

    poke(&client1).await;
    let mut kinds = Vec::new();
    for _ in 0..2 {
        let n = recv_notification(&mut rx1, Duration::from_secs(5))
            .await
            .expect("expected notification");
        let v: serde_json::Value = serde_json::from_str(n.payload()).unwrap();
        kinds.extend(v.as_object().unwrap().keys().cloned());
    }
    assert_eq!(kinds, ["BookingStatusChanged", "PaymentStatusChanged"]);
}

#[tokio::test]
async fn listen_validates_channel() {
    let (addr, _tm) = start_test_server().await;
    let (client, _rx) = connect(addr).await;

    assert_eq!(error_code(&client, "LISTEN bookings").await, "42000");
    assert_eq!(
        error_code(&client, &format!("LISTEN resource_{}", Ulid::new())).await,
        "P0002"
    );
}

#[tokio::test]
async fn disconnect_cleans_up() {
    let (addr, _tm) = start_test_server().await;
    let (client1, rx1) = connect(addr).await;
    let rid = create_cafe(&client1).await;
    client1.batch_execute(&format!("LISTEN resource_{rid}")).await.unwrap();

    drop(client1);
    drop(rx1);
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Writers are never blocked by a vanished listener.
    let (client2, _) = connect(addr).await;
    client2.batch_execute(&booking_sql(rid, "C1", "18:00", 1)).await.unwrap();
}
