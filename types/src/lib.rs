mod condition;
mod error_info;
mod names;
mod state;
mod workspace;

pub use condition::*;
pub use error_info::*;
pub use names::*;
pub use state::*;
pub use workspace::*;
