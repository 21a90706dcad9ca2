// src/core/mod.rs

//! The central module containing the controller's core logic: the image
//! catalog (Source + Node View + Service), the prepuller, the lab lifecycle
//! manager, the file-server manager, the Kubernetes adapter, and the
//! progress event bus.

pub mod errors;
pub mod events;
pub mod fileserver;
pub mod images;
pub mod k8s;
pub mod lab;
pub mod metrics;
pub mod prepuller;
pub mod scheduler;

pub use errors::ControllerError;
pub use events::ProgressEventBus;
pub use scheduler::Scheduler;
