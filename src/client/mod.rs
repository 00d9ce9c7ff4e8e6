//! Client facades and the per-process directory that owns them

mod cache;
mod connection;
pub mod directory;
pub mod facade;
pub mod stats;

pub use cache::OutstandingSend;
pub use directory::ClientDirectory;
pub use facade::{BufferPoolClient, ClientMode};
pub use stats::ClientStats;
