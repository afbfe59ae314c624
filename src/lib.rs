//! wipercheck-infra: declarative AWS infrastructure for the wipercheck
//! service and loader.
//!
//! One YAML file declares stacks of resources. Each stack synthesizes to a
//! CloudFormation template, deploys in dependency order through the AWS CLI,
//! and records a BLAKE3-hashed lock plus a JSONL provenance log.

pub mod cli;
pub mod core;
pub mod resources;
pub mod transport;
pub mod tripwire;
