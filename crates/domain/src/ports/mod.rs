pub mod clock;
pub mod hooks;
pub mod notifier;
pub mod provider;
pub mod queue;

pub use clock::*;
pub use hooks::*;
pub use notifier::*;
pub use provider::*;
pub use queue::*;
