mod id;
mod node;
mod routing_table;
mod storage;
mod value;

pub use id::*;
pub use node::*;
pub use routing_table::*;
pub use storage::*;
pub use value::*;
