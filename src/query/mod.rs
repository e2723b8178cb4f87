mod desc;
mod filter;
mod query;
mod view;

pub use desc::{ComponentRef, NamedQueryDesc, QueryDesc, MAX_RW_COMPONENTS};
pub use query::{QueryArchetype, QueryID, QueryManager};
pub use view::{QueryContext, QueryView};
