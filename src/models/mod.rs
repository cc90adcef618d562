// src/models/mod.rs
pub mod booking;
pub mod driver;
pub mod earning;
pub mod fare;
pub mod location;

pub use booking::*;
pub use driver::*;
pub use earning::*;
pub use fare::*;
pub use location::*;
