//! The domain vocabulary: reservations, persistent disks, the GPU type catalog, queue
//! messages and the opaque user/api-key identifiers the core treats as foreign keys.

pub mod disk;
pub mod gpu_type;
pub mod queue;
pub mod reservation;
pub mod user;

pub use disk::*;
pub use gpu_type::*;
pub use queue::*;
pub use reservation::*;
pub use user::*;
