pub mod invoice;
pub mod sync;
pub mod transaction_line;

pub use invoice::{InvoiceAggregate, InvoiceItem, PriorRecord};
pub use sync::{SyncKind, SyncProgress, SyncRun, SyncState, SyncStatus, SyncSummary};
pub use transaction_line::TransactionLine;
