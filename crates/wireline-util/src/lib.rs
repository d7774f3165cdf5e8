mod arrayvec;
mod assert;
mod thread;

pub use arrayvec::ArrayVec;
pub use thread::pin_to_core;
