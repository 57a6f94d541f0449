pub mod image_tool;
pub mod naming;
pub mod pipeline;
pub mod probe;
pub mod session;
pub mod storage;
pub mod versions;
