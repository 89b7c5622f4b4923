pub mod arena;
pub mod buffers;

pub use arena::{PersistentArena, Reservation};
pub use buffers::{MultiDrawBuffers, MultiDrawSubmission};
