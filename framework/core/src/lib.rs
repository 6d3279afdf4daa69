mod failure;
mod shutdown;

pub mod prelude {
    pub use crate::failure::ScenarioError;
    pub use crate::shutdown::{ShutdownHandle, ShutdownListener, ShutdownSignalError};
}
