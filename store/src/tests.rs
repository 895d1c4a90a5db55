//! Exercises the store against a real Postgres. Skipped unless `DATABASE_URL` points at a
//! scratch database - these are integration tests, not unit tests, since everything here
//! is `sqlx` talking to a live backend.

use crate::{disks, gpu_types, queue, reservations, Store};
use chrono::Utc;
use common_lib::types::{Disk, GpuType, Reservation, ReservationStatus};
use uuid::Uuid;

async fn test_store() -> Option<Store> {
    let url = std::env::var("DATABASE_URL").ok()?;
    Some(Store::connect(&url, 5).await.expect("connect to test database"))
}

fn sample_gpu_type(tag: &str) -> GpuType {
    GpuType {
        tag: tag.to_string(),
        instance_family: "g4dn.xlarge".to_string(),
        gpus_per_node: 4,
        cpu_per_node: 48,
        memory_gb_per_node: 192,
        active: true,
        multi_node_capable: false,
        total_gpus: 0,
        available_gpus: 0,
        max_reservable: 0,
        full_nodes_available: 0,
        running_instances: 0,
        last_updated_at: None,
        updated_by: None,
    }
}

async fn seed_gpu_type(store: &Store, tag: &str) {
    sqlx::query(
        "INSERT INTO gpu_types (tag, instance_family, gpus_per_node, cpu_per_node, memory_gb_per_node, active, multi_node_capable)
         VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (tag) DO NOTHING",
    )
    .bind(tag)
    .bind(&sample_gpu_type(tag).instance_family)
    .bind(4_i32)
    .bind(48_i32)
    .bind(192_i32)
    .bind(true)
    .bind(false)
    .execute(store.pool())
    .await
    .unwrap();
}

#[tokio::test]
async fn enqueue_and_insert_are_atomic() {
    let Some(store) = test_store().await else { return };
    seed_gpu_type(&store, "t4-atomic").await;

    let reservation = Reservation::new(Uuid::new_v4(), "alice", "t4-atomic", 1, 2.0, Utc::now());
    let msg_id = store
        .with_tx(|tx| {
            let reservation = reservation.clone();
            Box::pin(async move {
                reservations::insert(tx, &reservation).await?;
                queue::enqueue(tx, "gpu_reservations", "create", Some(reservation.id), None, serde_json::json!({})).await
            })
        })
        .await
        .unwrap();

    assert!(msg_id > 0);
    let fetched = reservations::get(store.pool(), reservation.id).await.unwrap();
    assert_eq!(fetched.status, ReservationStatus::Pending);
}

#[tokio::test]
async fn dequeue_hides_message_until_visibility_timeout() {
    let Some(store) = test_store().await else { return };
    seed_gpu_type(&store, "t4-vis").await;
    let reservation = Reservation::new(Uuid::new_v4(), "bob", "t4-vis", 1, 1.0, Utc::now());
    store
        .with_tx(|tx| {
            let reservation = reservation.clone();
            Box::pin(async move {
                reservations::insert(tx, &reservation).await?;
                queue::enqueue(tx, "gpu_reservations", "create", Some(reservation.id), None, serde_json::json!({})).await
            })
        })
        .await
        .unwrap();

    let first = queue::dequeue(store.pool(), "gpu_reservations", 10, 900).await.unwrap();
    assert_eq!(first.len(), 1);

    let second = queue::dequeue(store.pool(), "gpu_reservations", 10, 900).await.unwrap();
    assert!(second.is_empty(), "message should be hidden within its visibility timeout");

    queue::ack(store.pool(), first[0].id).await.unwrap();
}

#[tokio::test]
async fn status_cas_is_exclusive() {
    let Some(store) = test_store().await else { return };
    seed_gpu_type(&store, "t4-cas").await;
    let reservation = Reservation::new(Uuid::new_v4(), "carol", "t4-cas", 1, 1.0, Utc::now());
    store
        .with_tx(|tx| {
            let reservation = reservation.clone();
            Box::pin(async move { reservations::insert(tx, &reservation).await })
        })
        .await
        .unwrap();

    let won = store
        .with_tx(|tx| Box::pin(reservations::cas_status(tx, reservation.id, ReservationStatus::Pending, ReservationStatus::Queued)))
        .await
        .unwrap();
    assert!(won);

    // A second attempt to make the same transition loses the race - the row already moved.
    let lost = store
        .with_tx(|tx| Box::pin(reservations::cas_status(tx, reservation.id, ReservationStatus::Pending, ReservationStatus::Queued)))
        .await
        .unwrap();
    assert!(!lost);
}

#[tokio::test]
async fn disk_in_use_flag_round_trips() {
    let Some(store) = test_store().await else { return };
    let disk = Disk {
        id: Uuid::new_v4(),
        user: "dana".to_string(),
        name: "scratch".to_string(),
        volume_id: format!("vol-{}", Uuid::new_v4()),
        az: "us-east-1a".to_string(),
        size_gb: 100,
        in_use: false,
        in_use_by: None,
        last_snapshot_id: None,
        pending_snapshot_count: 0,
        completed_snapshot_count: 0,
        creating: false,
        deleting: false,
        soft_deleted_at: None,
        last_reconciled_at: None,
        created_at: Utc::now(),
    };
    store
        .with_tx(|tx| {
            let disk = disk.clone();
            Box::pin(async move { disks::insert(tx, &disk).await })
        })
        .await
        .unwrap();

    let reservation_id = Uuid::new_v4();
    let mut locked = store
        .with_tx(|tx| Box::pin(disks::get_for_update(tx, disk.id)))
        .await
        .unwrap();
    locked.in_use = true;
    locked.in_use_by = Some(reservation_id);
    store
        .with_tx(|tx| {
            let locked = locked.clone();
            Box::pin(async move { disks::update(tx, &locked).await })
        })
        .await
        .unwrap();

    let fetched = disks::get_by_user_and_name(store.pool(), "dana", "scratch").await.unwrap().unwrap();
    assert!(fetched.in_use);
    assert_eq!(fetched.in_use_by, Some(reservation_id));
}

#[tokio::test]
async fn availability_upsert_is_idempotent() {
    let Some(store) = test_store().await else { return };
    seed_gpu_type(&store, "t4-tick").await;

    store
        .with_tx(|tx| Box::pin(gpu_types::upsert_availability(tx, "t4-tick", 8, 5, 4, 1, 2, "tracker-1")))
        .await
        .unwrap();
    let first = gpu_types::get(store.pool(), "t4-tick").await.unwrap();

    store
        .with_tx(|tx| Box::pin(gpu_types::upsert_availability(tx, "t4-tick", 8, 5, 4, 1, 2, "tracker-1")))
        .await
        .unwrap();
    let second = gpu_types::get(store.pool(), "t4-tick").await.unwrap();

    assert_eq!(first.total_gpus, second.total_gpus);
    assert_eq!(first.available_gpus, second.available_gpus);
    assert_eq!(first.max_reservable, second.max_reservable);
}
