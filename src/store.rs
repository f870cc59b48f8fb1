pub mod memory;
pub mod models;
pub mod postgres;
pub mod traits;

pub use memory::InMemoryStore;
pub use postgres::PgStore;
pub use traits::{EmbeddingCacheStore, PostStore, SessionStore, ZoneAccess};
