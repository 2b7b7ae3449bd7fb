pub mod error;
pub mod executor;
pub mod idempotency;
pub mod manager;
pub mod points;
pub mod pricing;
pub mod recovery;
pub mod retry;
pub mod sqlite_store;
pub mod store;

pub use error::*;
pub use executor::*;
pub use idempotency::*;
pub use manager::*;
pub use points::*;
pub use pricing::*;
pub use recovery::*;
pub use retry::*;
pub use sqlite_store::*;
pub use store::*;
