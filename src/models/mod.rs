pub mod anomaly;
pub mod cursor;
pub mod event;

pub use anomaly::*;
pub use cursor::*;
pub use event::*;
