//! Transports implementing [`crate::link::Link`].

pub mod local;

pub use local::{LocalFabric, LocalLink};
