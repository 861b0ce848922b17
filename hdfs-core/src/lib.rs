pub mod error;
pub mod model;
pub mod roles;
#[cfg(test)]
mod roles_test;

pub use error::AppError;

/// The number of namenode units which take part in an HA deployment.
pub const HA_CLUSTER_SIZE: usize = 3;
