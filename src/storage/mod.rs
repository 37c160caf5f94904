mod memory;
pub mod models;
mod store;

pub use memory::MemorySessionStore;
pub use store::{SessionStore, StoreError};
