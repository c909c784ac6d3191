//! Render service client and operation poller.
//!
//! The render service turns prompts into videos asynchronously: a submission
//! returns an operation id whose status is polled until the video is ready.

pub mod client;
pub mod error;
pub mod poller;
pub mod types;

pub use client::{OperationStatusSource, RenderClient, RenderClientConfig, RenderService};
pub use error::{RenderError, RenderResult};
pub use poller::{
    BatchPollReport, OperationPoller, PollError, PollEvent, PollOptions, PollState, PollSubscription,
    SessionInfo,
};
pub use types::{
    ContextImage, OperationError, OperationHandle, OperationResult, OperationStatus, RenderRequest,
};
