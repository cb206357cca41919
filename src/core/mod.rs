pub mod analyzer;
pub mod cancel;
pub mod domain;
pub mod errors;
pub mod orchestrator;
pub mod pipeline;
pub mod report;
pub mod result_set;
pub mod traits;
