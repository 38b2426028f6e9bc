pub mod aggregate;
pub mod driver;
pub mod fetcher;
pub mod hasher;
pub mod ledger;
pub mod normalizer;
pub mod reconcile;
pub mod scheduler;
pub mod store;

pub use driver::{ProgressCallback, StartCallback, SyncEngine, SyncOptions};
pub use fetcher::{Credentials, ErpClient, PageSource, ProxyRequest};
pub use ledger::{RunLedger, RunTracker};
pub use reconcile::{ChangeKind, ReconcileCounts, Reconciler};
pub use store::{InvoiceStore, SyncLock};
