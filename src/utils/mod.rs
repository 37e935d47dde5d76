pub mod error;
pub mod logging;
pub mod periodic;
pub mod shutdown;
pub mod status;
pub mod time;

pub use error::{PipelineError, PipelineResult};
pub use periodic::spawn_periodic;
pub use shutdown::Shutdown;
pub use status::StatusFile;
