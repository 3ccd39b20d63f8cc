use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, Config, NoTls, Notification, SimpleQueryMessage};
use ulid::Ulid;

use medislot::tenant::TenantManager;
use medislot::wire;

const PASSWORD: &str = "medislot";
/// 2030-01-07 is a Monday.
const MONDAY: &str = "2030-01-07";

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("medislot_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string(), None).await;
            });
        }
    });

    addr
}

/// Connect as `user`; notifications are forwarded to the returned channel.
async fn connect(addr: SocketAddr, user: &str) -> (Client, mpsc::UnboundedReceiver<Notification>) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clinic")
        .user(user)
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let messages = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(messages);
        while let Some(msg) = messages.next().await {
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

async fn admin(addr: SocketAddr) -> Client {
    connect(addr, "admin").await.0
}

/// Register a doctor open 09:00-12:00 on Mondays.
async fn morning_doctor(admin: &Client) -> Ulid {
    let doctor = Ulid::new();
    admin
        .batch_execute(&format!("INSERT INTO doctors (id, name) VALUES ('{doctor}', 'Dr. Wire')"))
        .await
        .unwrap();
    admin
        .batch_execute(&format!(
            r#"INSERT INTO availability (doctor_id, weekday, start, "end", is_available) VALUES ('{doctor}', 'monday', '09:00', '12:00', true)"#
        ))
        .await
        .unwrap();
    doctor
}

fn book_sql(id: Ulid, doctor: Ulid, patient: Ulid, time: &str) -> String {
    format!(
        "INSERT INTO appointments (id, doctor_id, patient_id, date, time) VALUES ('{id}', '{doctor}', '{patient}', '{MONDAY}', '{time}')"
    )
}

/// Data rows of a simple query, as maps of column name to text.
async fn rows(client: &Client, sql: &str) -> Vec<Vec<(String, Option<String>)>> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|msg| match msg {
            SimpleQueryMessage::Row(row) => Some(
                row.columns()
                    .iter()
                    .enumerate()
                    .map(|(i, col)| (col.name().to_string(), row.get(i).map(str::to_string)))
                    .collect(),
            ),
            _ => None,
        })
        .collect()
}

fn column<'a>(row: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    row.iter()
        .find(|(col, _)| col == name)
        .and_then(|(_, v)| v.as_deref())
}

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

/// Notifications are flushed at the listener's next statement.
async fn poll(client: &Client, rx: &mut mpsc::UnboundedReceiver<Notification>) -> Vec<Notification> {
    client.simple_query("SELECT * FROM doctors").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut out = Vec::new();
    while let Ok(n) = rx.try_recv() {
        out.push(n);
    }
    out
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn slots_shrink_as_bookings_land() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let slots = rows(
        &admin,
        &format!("SELECT * FROM slots WHERE doctor_id = '{doctor}' AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(slots.len(), 6);
    assert_eq!(column(&slots[0], "time"), Some("09:00"));

    let patient = Ulid::new();
    let (client, _rx) = connect(addr, &format!("patient_{patient}")).await;
    client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "09:30"))
        .await
        .unwrap();

    let times: Vec<_> = rows(
        &admin,
        &format!("SELECT * FROM slots WHERE doctor_id = '{doctor}' AND date = '{MONDAY}'"),
    )
    .await
    .iter()
    .filter_map(|r| column(r, "time").map(str::to_string))
    .collect();
    assert_eq!(times, ["09:00", "10:00", "10:30", "11:00", "11:30"]);
}

#[tokio::test]
async fn second_booking_for_slot_is_unique_violation() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let (first, second) = (Ulid::new(), Ulid::new());
    let (c1, _) = connect(addr, &format!("patient_{first}")).await;
    let (c2, _) = connect(addr, &format!("patient_{second}")).await;

    c1.batch_execute(&book_sql(Ulid::new(), doctor, first, "10:00"))
        .await
        .unwrap();
    let err = c2
        .batch_execute(&book_sql(Ulid::new(), doctor, second, "10:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));

    // An overlapping hour is refused the same way.
    let err = c2
        .batch_execute(&format!(
            "INSERT INTO appointments (id, doctor_id, patient_id, date, time, duration) VALUES ('{}', '{doctor}', '{second}', '{MONDAY}', '09:30', 60)",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23505"));
}

#[tokio::test]
async fn booking_outside_hours_is_invalid_input() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let (client, _) = connect(addr, &format!("patient_{patient}")).await;
    let err = client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "11:45"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));

    let err = admin
        .batch_execute(&format!(
            r#"INSERT INTO availability (doctor_id, weekday, start, "end") VALUES ('{doctor}', 'tuesday', '17:00', '09:00')"#
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn unknown_doctor_is_not_found() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let err = admin
        .simple_query(&format!(
            "SELECT * FROM slots WHERE doctor_id = '{}' AND date = '{MONDAY}'",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("P0002"));
}

#[tokio::test]
async fn cancel_reports_rows_and_is_idempotent() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let appointment = Ulid::new();
    let (client, _) = connect(addr, &format!("patient_{patient}")).await;
    client
        .batch_execute(&book_sql(appointment, doctor, patient, "09:00"))
        .await
        .unwrap();

    let cancel = format!("DELETE FROM appointments WHERE id = '{appointment}'");
    assert_eq!(client.execute(cancel.as_str(), &[]).await.unwrap(), 1);
    assert_eq!(client.execute(cancel.as_str(), &[]).await.unwrap(), 0);

    // The record stays, marked cancelled, and the slot is free again.
    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE id = '{appointment}'")).await;
    assert_eq!(column(&listed[0], "status"), Some("cancelled"));
    client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "09:00"))
        .await
        .unwrap();
}

#[tokio::test]
async fn strangers_cannot_cancel_or_read() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let appointment = Ulid::new();
    let (owner, _) = connect(addr, &format!("patient_{patient}")).await;
    owner
        .batch_execute(&book_sql(appointment, doctor, patient, "09:00"))
        .await
        .unwrap();

    let (stranger, _) = connect(addr, &format!("patient_{}", Ulid::new())).await;
    let err = stranger
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = stranger
        .simple_query(&format!("SELECT * FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    // Listings quietly leave out other people's appointments.
    let listed = rows(&stranger, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert!(listed.is_empty());
    let listed = rows(&owner, &format!("SELECT * FROM appointments WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn rating_needs_completion() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let appointment = Ulid::new();
    let (client, _) = connect(addr, &format!("patient_{patient}")).await;
    client
        .batch_execute(&book_sql(appointment, doctor, patient, "10:00"))
        .await
        .unwrap();

    let rate = format!("INSERT INTO ratings (appointment_id, rating, review) VALUES ('{appointment}', 5, 'thorough')");
    let err = client.batch_execute(&rate).await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let (doc, _) = connect(addr, &format!("doctor_{doctor}")).await;
    doc.batch_execute(&format!(
        "INSERT INTO appointment_status (appointment_id, status) VALUES ('{appointment}', 'completed')"
    ))
    .await
    .unwrap();
    client.batch_execute(&rate).await.unwrap();

    let listed = rows(&client, &format!("SELECT * FROM appointments WHERE patient_id = '{patient}'")).await;
    assert_eq!(column(&listed[0], "rating"), Some("5"));
    assert_eq!(column(&listed[0], "review"), Some("thorough"));

    // Completed is terminal.
    let err = client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));
}

#[tokio::test]
async fn doctor_hears_about_bookings_and_cancellations() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let (doc, mut doc_rx) = connect(addr, &format!("doctor_{doctor}")).await;
    doc.batch_execute(&format!("LISTEN doctor_{doctor}")).await.unwrap();

    let patient = Ulid::new();
    let appointment = Ulid::new();
    let (client, _) = connect(addr, &format!("patient_{patient}")).await;
    client
        .batch_execute(&book_sql(appointment, doctor, patient, "11:00"))
        .await
        .unwrap();
    client
        .batch_execute(&format!("DELETE FROM appointments WHERE id = '{appointment}'"))
        .await
        .unwrap();

    let received = poll(&doc, &mut doc_rx).await;
    assert_eq!(received.len(), 2);
    assert!(received.iter().all(|n| n.channel() == format!("doctor_{doctor}")));

    let booked: serde_json::Value = serde_json::from_str(received[0].payload()).unwrap();
    assert_eq!(booked["event"], "appointment_booked");
    assert_eq!(booked["appointment_id"], appointment.to_string());
    assert_eq!(booked["patient_id"], patient.to_string());
    assert_eq!(booked["time"], "11:00");

    let cancelled: serde_json::Value = serde_json::from_str(received[1].payload()).unwrap();
    assert_eq!(cancelled["event"], "appointment_cancelled");
}

#[tokio::test]
async fn failed_booking_is_silent() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let (client, mut rx) = connect(addr, &format!("patient_{patient}")).await;
    client.batch_execute(&format!("LISTEN patient_{patient}")).await.unwrap();

    let err = client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "13:00"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
    assert!(poll(&client, &mut rx).await.is_empty());
}

#[tokio::test]
async fn unlisten_stops_notifications() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let patient = Ulid::new();
    let (client, mut rx) = connect(addr, &format!("patient_{patient}")).await;
    client.batch_execute(&format!("LISTEN patient_{patient}")).await.unwrap();
    client.batch_execute(&format!("UNLISTEN patient_{patient}")).await.unwrap();
    client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "09:00"))
        .await
        .unwrap();
    assert!(poll(&client, &mut rx).await.is_empty());

    client.batch_execute(&format!("LISTEN patient_{patient}")).await.unwrap();
    client.batch_execute("UNLISTEN *").await.unwrap();
    client
        .batch_execute(&book_sql(Ulid::new(), doctor, patient, "10:00"))
        .await
        .unwrap();
    assert!(poll(&client, &mut rx).await.is_empty());
}

#[tokio::test]
async fn listening_on_someone_elses_channel_is_forbidden() {
    let addr = start_test_server().await;
    let (client, _) = connect(addr, &format!("patient_{}", Ulid::new())).await;
    let err = client
        .batch_execute(&format!("LISTEN patient_{}", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = client.batch_execute("LISTEN resource_x").await.unwrap_err();
    assert!(sqlstate(&err).is_some());
}

#[tokio::test]
async fn recommendations_return_top_three() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let ranked = rows(
        &admin,
        &format!("SELECT * FROM recommended_slots WHERE doctor_id = '{doctor}' AND date = '{MONDAY}'"),
    )
    .await;
    assert_eq!(ranked.len(), 3);
    // No history: every morning slot scores the same, earliest first.
    let times: Vec<_> = ranked.iter().filter_map(|r| column(r, "time")).collect();
    assert_eq!(times, ["09:00", "09:30", "10:00"]);
}

#[tokio::test]
async fn weekly_schedule_lists_every_day() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let week = rows(&admin, &format!("SELECT * FROM availability WHERE doctor_id = '{doctor}'")).await;
    assert_eq!(week.len(), 7);
    assert_eq!(column(&week[0], "weekday"), Some("monday"));
    assert_eq!(column(&week[0], "is_available"), Some("t"));
    assert_eq!(column(&week[1], "is_available"), Some("f"));
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let doctor_str = doctor.to_string();
    let found = admin
        .query(
            "SELECT * FROM slots WHERE doctor_id = $1 AND date = $2",
            &[&doctor_str, &MONDAY],
        )
        .await
        .unwrap();
    assert_eq!(found.len(), 6);
    let first: &str = found[0].get("time");
    assert_eq!(first, "09:00");
}

#[tokio::test]
async fn bound_notes_may_contain_placeholder_text() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let doctor = morning_doctor(&admin).await;

    let id = Ulid::new().to_string();
    let doctor = doctor.to_string();
    let patient = Ulid::new().to_string();
    let notes = "bring scan from $1 visit, it's $2";
    let inserted = admin
        .execute(
            "INSERT INTO appointments (id, doctor_id, patient_id, date, time, duration, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[&id, &doctor, &patient, &MONDAY, &"10:00", &"30", &notes],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let found = rows(&admin, &format!("SELECT * FROM appointments WHERE id = '{id}'")).await;
    assert_eq!(found.len(), 1);
    assert_eq!(column(&found[0], "notes"), Some(notes));
    assert_eq!(column(&found[0], "time"), Some("10:00"));
}

#[tokio::test]
async fn malformed_patient_login_is_refused() {
    let addr = start_test_server().await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("clinic")
        .user("patient_not-a-ulid")
        .password(PASSWORD);

    let err = config.connect(NoTls).await.err().unwrap();
    assert_eq!(sqlstate(&err), Some("28000"));
}
