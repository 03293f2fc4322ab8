pub mod channel;
pub mod guide;

pub use channel::*;
pub use guide::*;
