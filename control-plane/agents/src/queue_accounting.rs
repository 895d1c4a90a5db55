//! Recomputes queue position and ETA for every waiter of a GPU type. Run after any
//! terminal transition that frees capacity (cancel/expire/fail) and on every tracker tick.

use chrono::Utc;
use common_lib::errors::Result;
use store::Store;

/// Ranks queued reservations of `gpu_type` by creation time ascending and estimates each
/// one's wait by walking the active reservations of that type in ascending expiry order,
/// accumulating freed capacity until enough would be free to satisfy the waiter.
#[tracing::instrument(skip(store))]
pub async fn recompute_for_gpu_type(store: &Store, gpu_type: &str) -> Result<()> {
    let now = Utc::now();

    let gpu_type_row = match store::gpu_types::get(store.pool(), gpu_type).await {
        Ok(row) => row,
        Err(store::Error::NotFound { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    let waiters = store::reservations::list_queued_by_gpu_type(store.pool(), gpu_type).await?;
    if waiters.is_empty() {
        return Ok(());
    }

    let mut active = store::reservations::list_active_by_gpu_type(store.pool(), gpu_type).await?;
    active.retain(|r| r.expires_at.is_some());
    active.sort_by_key(|r| r.expires_at.unwrap());

    for (index, waiter) in waiters.iter().enumerate() {
        let position = (index + 1) as u32;

        let mut available = gpu_type_row.available_gpus;
        let mut eta_minutes: u32 = 0;
        if available < waiter.gpu_count {
            for candidate in &active {
                available += candidate.gpu_count;
                let minutes = (candidate.expires_at.unwrap() - now).num_minutes().max(0);
                eta_minutes = minutes as u32;
                if available >= waiter.gpu_count {
                    break;
                }
            }
        }

        let reservation_id = waiter.id;
        store
            .with_tx(|tx| {
                Box::pin(async move {
                    let mut current = store::reservations::get_for_update(tx, reservation_id).await?;
                    if current.status == common_lib::types::ReservationStatus::Queued {
                        current.queue_position = Some(position);
                        current.eta_minutes = Some(eta_minutes);
                        store::reservations::update(tx, &current).await?;
                    }
                    Ok(())
                })
            })
            .await?;
    }

    Ok(())
}
