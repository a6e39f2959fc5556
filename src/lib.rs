//! Provisions, re-signs, and installs app packages onto connected devices
//! through a developer-portal account.
//!
//! The heart of the crate is [`pipeline::InstallPipeline`], which drives a
//! run through its stages: authenticate, resolve the team and certificate,
//! prepare the device, stage the package, resolve provisioning profiles,
//! re-sign, and install. Every external boundary (portal, device transport,
//! signer, prompts, notifications) is a trait, with scripted implementations
//! in [`mock`] for tests.

pub mod anisette;
pub mod app;
pub mod certificates;
pub mod cli;
pub mod config;
pub mod device;
pub mod disk;
pub mod error;
pub mod interaction;
pub mod notify;
pub mod pipeline;
pub mod portal;
pub mod profiles;
pub mod signer;

pub mod mock;
