//! Request correlation: id allocation and the table of waiting callers.

mod ids;
mod table;

pub use ids::{IdAllocator, ID_SPACE};
pub use table::{Completion, PendingHandle, PendingTable};
