//! Constants every agent shares so pod labels, volume tags and ports stay consistent
//! across the processor, tracker and sweeper without a shared runtime dependency.

/// Node label the availability tracker and the processor's allocator both key off to find
/// the nodes belonging to a given GPU type's pool.
pub const GPU_TYPE_LABEL_KEY: &str = "gpu-reservations.io/gpu-type";

/// Pod/service label carrying the owning reservation id. Selector used by the tracker to
/// attribute in-use GPUs to reservations and by the sweeper to find a reservation's pod.
pub const RESERVATION_LABEL_KEY: &str = "gpu-reservations.io/reservation-id";

/// Cloud volume tag marking a volume as belonging to this platform; anything untagged is
/// not ours and is ignored by the disk reconciler.
pub const GPU_DEV_TAG_KEY: &str = "gpu-dev";
pub const GPU_DEV_TAG_VALUE: &str = "true";

/// Cloud volume tag recording the owning username, used to import an orphaned volume found
/// in the cloud but absent from the store.
pub const USER_TAG_KEY: &str = "user";

/// Cloud volume/snapshot tag recording the reservation that most recently touched it.
pub const RESERVATION_TAG_KEY: &str = "reservation-id";

/// Container port the sandbox's sshd listens on; published by the per-reservation service.
pub const SSH_CONTAINER_PORT: u16 = 2222;

/// Container port exposed only when interactive-notebook mode is enabled.
pub const NOTEBOOK_CONTAINER_PORT: u16 = 8888;

/// Mount path for the reservation's volume (persistent disk or ephemeral scratch).
pub const SANDBOX_MOUNT_PATH: &str = "/home/user";

/// Default sandbox container image when the request doesn't name one.
pub const DEFAULT_SANDBOX_IMAGE: &str = "gpu-reservations/sandbox-base:latest";

/// Path the sweeper writes pre-expiry warning markers to inside a live sandbox.
pub fn warning_marker_path(minutes: u64) -> String {
    format!("/etc/gpu-reservation/warning-{minutes}m")
}

/// Environment variables a create request may not override - anything that would let a
/// user's sandbox masquerade as the platform's own control plane identity.
pub const ENV_DENYLIST: &[&str] = &[
    "PATH",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "KUBERNETES_SERVICE_HOST",
    "KUBERNETES_SERVICE_PORT",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
];

/// Node topology label read to place a newly created disk in the same availability zone as
/// the reservation's target node.
pub const NODE_ZONE_LABEL_KEY: &str = "topology.kubernetes.io/zone";
