pub mod ledger;
pub mod lock;
pub mod pool;
pub mod queries;
pub mod store;

pub use pool::{create_pool, run_migrations};
pub use store::PgStore;
