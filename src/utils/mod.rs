pub mod latch;
pub mod urls;
pub mod validation;
