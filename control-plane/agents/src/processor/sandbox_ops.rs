use super::Processor;
use crate::naming;
use cluster_adapter::{PodSpec, ServiceSpec, VolumeMount};
use common_lib::errors::{Error, Result};
use common_lib::types::{AddUserPayload, QueueMessage, RebuildImagePayload, Reservation, ReservationStatus};

/// Appends a collaborator's key to the live sandbox. Collaborators are additive and not
/// removable through this path (no `remove_user` kind exists); redelivery just re-writes
/// the same key, which `write_file_in_pod` overwrites rather than duplicates.
pub(super) async fn handle_add_user(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "add_user message missing reservation_id".to_string() })?;
    let payload: AddUserPayload = serde_json::from_value(message.payload.clone()).unwrap_or_default();
    let (Some(username), Some(ssh_public_key)) = (payload.username, payload.ssh_public_key) else {
        return Err(Error::Validation { reason: "add_user requires both username and ssh_public_key".to_string() });
    };

    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;
    if reservation.status != ReservationStatus::Active {
        return Ok(()); // stale or racing against activation; no-op rather than failing a healthy reservation
    }

    let sandbox_name = reservation.sandbox_name.clone().ok_or_else(|| Error::Logic { detail: "active reservation has no sandbox_name".to_string() })?;
    let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone());
    let path = format!("{}/collaborator-keys/{username}.pub", naming::SANDBOX_MOUNT_PATH);
    processor.cluster.write_file_in_pod(&namespace, &sandbox_name, &path, ssh_public_key.as_bytes()).await?;

    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            let username = username.clone();
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if !current.collaborators.contains(&username) {
                    current.collaborators.push(username);
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    Ok(())
}

pub(super) async fn handle_enable_interactive(processor: &Processor, message: &QueueMessage) -> Result<()> {
    set_interactive(processor, message, true).await
}

pub(super) async fn handle_disable_interactive(processor: &Processor, message: &QueueMessage) -> Result<()> {
    set_interactive(processor, message, false).await
}

/// Toggles the notebook port on the reservation's service. The sandbox pod itself is
/// unaffected; only the published `ServiceSpec` changes, so this is cheap enough to run
/// synchronously in the handler rather than going through the pod-recreate path.
async fn set_interactive(processor: &Processor, message: &QueueMessage, interactive: bool) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "message missing reservation_id".to_string() })?;
    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;
    if reservation.status != ReservationStatus::Active {
        return Ok(()); // stale or racing against activation; no-op rather than failing a healthy reservation
    }

    let sandbox_name = reservation.sandbox_name.clone().ok_or_else(|| Error::Logic { detail: "active reservation has no sandbox_name".to_string() })?;
    let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone());

    let mut selector = std::collections::BTreeMap::new();
    selector.insert(naming::RESERVATION_LABEL_KEY.to_string(), reservation.id.to_string());
    let mut extra_ports = Vec::new();
    if interactive {
        extra_ports.push(("notebook".to_string(), naming::NOTEBOOK_CONTAINER_PORT, naming::NOTEBOOK_CONTAINER_PORT));
    }

    processor.cluster.delete_service(&sandbox_name, &namespace).await?;
    let service = ServiceSpec {
        name: sandbox_name,
        namespace,
        selector_labels: selector,
        ssh_target_port: naming::SSH_CONTAINER_PORT,
        extra_ports,
    };
    let service_ref = processor.cluster.create_service(service).await?;

    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            let interactive_value = if interactive { "1".to_string() } else { "0".to_string() };
            let service_ref = service_ref.clone();
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                current.env.insert("GPU_RESERVATION_INTERACTIVE".to_string(), interactive_value);
                current.ssh_endpoint = Some(common_lib::types::SshEndpoint { host: service_ref.host, port: service_ref.port });
                store::reservations::update(tx, &current).await
            })
        })
        .await?;

    Ok(())
}

/// Tears down and recreates the sandbox pod with a new image, preserving the reservation's
/// volume mount. Node placement is read off the live pod rather than re-derived, since the
/// reservation already holds its GPUs and shouldn't be reshuffled onto different hardware.
pub(super) async fn handle_rebuild_image(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "rebuild_image message missing reservation_id".to_string() })?;
    let payload: RebuildImagePayload = serde_json::from_value(message.payload.clone()).unwrap_or_default();
    let Some(docker_image) = payload.docker_image else {
        return Err(Error::Validation { reason: "rebuild_image requires docker_image".to_string() });
    };

    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;
    if reservation.status != ReservationStatus::Active {
        return Ok(()); // stale or racing against activation; no-op rather than failing a healthy reservation
    }

    let sandbox_name = reservation.sandbox_name.clone().ok_or_else(|| Error::Logic { detail: "active reservation has no sandbox_name".to_string() })?;
    let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone());

    let pods = processor.cluster.list_pods(&namespace, "").await?;
    let node_names: Vec<String> = pods
        .iter()
        .find(|p| p.name == sandbox_name)
        .and_then(|p| p.node_name.clone())
        .map(|n| vec![n])
        .unwrap_or_default();

    processor.cluster.delete_pod(&sandbox_name, &namespace, 30).await?;

    let volume = reservation.volume_id.as_ref().map(|id| VolumeMount { cloud_volume_id: Some(id.clone()), mount_path: naming::SANDBOX_MOUNT_PATH.to_string() });
    let mut updated = reservation.clone();
    updated.docker_image = Some(docker_image);
    let spec = build_spec(processor, &updated, node_names, volume);
    processor.cluster.create_pod(spec).await?;

    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            let docker_image = updated.docker_image.clone();
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                current.docker_image = docker_image;
                store::reservations::update(tx, &current).await
            })
        })
        .await?;

    Ok(())
}

fn build_spec(processor: &Processor, reservation: &Reservation, node_names: Vec<String>, volume: Option<VolumeMount>) -> PodSpec {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert(naming::RESERVATION_LABEL_KEY.to_string(), reservation.id.to_string());
    labels.insert(naming::GPU_TYPE_LABEL_KEY.to_string(), reservation.gpu_type.clone());

    PodSpec {
        name: Reservation::sandbox_name_for(reservation.id),
        namespace: reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone()),
        image: reservation.docker_image.clone().unwrap_or_else(|| naming::DEFAULT_SANDBOX_IMAGE.to_string()),
        gpu_count: reservation.gpu_count,
        cpu_millis: None,
        memory_mb: None,
        node_names,
        labels,
        env: reservation.env.clone(),
        ssh_public_keys: Vec::new(),
        volume,
    }
}
