pub mod job;
pub mod policy;
pub mod queue;
pub mod set;
pub mod stats;
