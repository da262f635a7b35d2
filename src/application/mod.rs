pub mod engine;
pub mod stdio;
pub mod tooling;
