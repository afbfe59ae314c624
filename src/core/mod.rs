//! Core logic: config types, parsing, reference resolution, template
//! synthesis, planning, and deploy execution.

pub mod audit;
pub mod codegen;
pub mod executor;
pub mod network;
pub mod parser;
pub mod planner;
pub mod resolver;
pub mod state;
pub mod synth;
pub mod types;
