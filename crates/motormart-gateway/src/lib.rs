pub mod config;
pub mod connection;
pub mod error;
pub mod push;
pub mod registry;
pub mod router;
pub mod session;

#[cfg(test)]
pub(crate) mod testing;
