pub mod digest;
pub mod errors;
pub mod status;
pub mod telemetry;
