pub mod account;
pub mod metric;
pub mod periodic;
pub mod publication;
pub mod quota;
pub mod task;
pub mod worker;

pub use account::*;
pub use metric::*;
pub use periodic::*;
pub use publication::*;
pub use quota::*;
pub use task::*;
pub use worker::*;
