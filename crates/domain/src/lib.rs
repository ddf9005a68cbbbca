pub mod events;
pub mod models;
pub mod ports;
pub mod repositories;
pub mod value_objects;

pub use events::*;
pub use models::*;
pub use ports::*;
pub use repositories::*;
pub use taskhub_errors::{ErrorKind, HubError, HubResult};
pub use value_objects::*;
