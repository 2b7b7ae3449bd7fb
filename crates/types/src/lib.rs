pub mod envelope;
pub mod execution;
pub mod feature;
pub mod params;
pub mod points;

pub use envelope::*;
pub use execution::*;
pub use feature::*;
pub use params::*;
pub use points::*;

/// Trailing window of the parameter-based reaccess cache, in hours
pub const DEFAULT_REACCESS_WINDOW_HOURS: i64 = 24;
