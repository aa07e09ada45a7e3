//! Data model shared between the `ontree` binary's engine, CLI and
//! `serve` surfaces. Kept dependency-light (no tokio, no reqwest) so it
//! can be reused by anything that only needs to read/write these shapes.

pub mod app;
pub mod error;
pub mod operation;
pub mod progress;
pub mod proxy;
pub mod setup;
pub mod vitals;

pub use app::{AgentMetadata, AppIdentifier, AppPaths, OnTreeMetadata};
pub use error::EngineError;
pub use operation::{Operation, OperationKind, OperationState};
pub use progress::{ProgressEvent, ProgressEventKind};
pub use proxy::ProxyRoute;
pub use setup::{SetupState, User};
pub use vitals::{VitalsRate, VitalsSample};
