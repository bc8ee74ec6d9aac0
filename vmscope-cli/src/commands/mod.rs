pub mod common;
pub mod entries;
pub mod flatten;
pub mod optimize;
