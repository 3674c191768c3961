//! # a3s-converse
//!
//! Streaming conversation engine for long-running remote agents.
//!
//! ## Overview
//!
//! `a3s-converse` drives a conversation with an agent server: it issues
//! commands, decodes the streamed reply into an in-memory log, extracts
//! metadata embedded in the text, gates risky tool uses behind an operator
//! decision, mirrors the log into a durable store, and re-establishes a
//! consistent view after the client goes away and comes back.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_converse::{AgentController, HttpTransport, TurnOutcome};
//! use a3s_converse::persistence::http::HttpDurableStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_converse::Result<()> {
//! let base_url = "http://localhost:4001";
//! let controller = AgentController::builder("builder")
//!     .transport(Arc::new(HttpTransport::new(base_url)))
//!     .store(Arc::new(HttpDurableStore::new(base_url, "/conversation")))
//!     .build()?;
//!
//! controller.on_mount().await?;
//! let turn = controller.send("ls -la").await?;
//! if let TurnOutcome::Completed { message_id } = turn.wait().await {
//!     println!("reply stored as {}", message_id);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **decoder**: `data: <json>` records into typed frames
//! - **sentinel**: `<<<METADATA:TYPE:JSON>>>` tokenizer
//! - **controller**: per-agent send/cancel, frame application, reload
//! - **approval**: tool-approval gate and policy
//! - **persistence**: `DurableStore` trait and the ordered writer
//! - **continuity**: reconcile and in-flight classification
//! - **hub**: per-agent controllers addressed by id

pub mod approval;
pub mod config;
pub mod continuity;
pub mod controller;
pub mod conversation;
pub mod decoder;
pub mod error;
pub mod event;
pub mod hub;
pub mod metadata;
pub mod persistence;
pub mod sentinel;
pub mod transport;
pub mod types;

// Re-export core types
pub use approval::{
    ApprovalGate, ApprovalPolicy, ContinuationDirective, GateState, NoContinuation, OnApproved,
    ToolCategory,
};
pub use config::{
    AgentEndpoint, ContinuityConfig, ControllerConfig, ConverseConfig, EndpointPaths,
    PersistenceConfig,
};
pub use continuity::{ReloadOutcome, TurnStatus};
pub use controller::{AgentController, AgentControllerBuilder, TurnHandle, TurnOutcome};
pub use conversation::{ConversationLog, UsageTotals};
pub use decoder::{decode_frames, Frame, FrameDecoder};
pub use error::{ConverseError, ErrorKind, Result};
pub use event::ConversationEvent;
pub use hub::ConversationHub;
pub use metadata::{MessageMetadata, MetadataEvent, MetadataKind, ToolUseEvent, Usage};
pub use persistence::{DurableStore, PersistenceBridge};
pub use transport::{AgentTransport, ByteStream};
pub use types::{Backend, Message, PendingApproval, Role};

// Re-export transports and stores for convenience
pub use persistence::file::FileDurableStore;
pub use persistence::http::HttpDurableStore;
pub use persistence::memory::MemoryDurableStore;
pub use transport::channel::{ChannelTransport, ReplyHandle};
pub use transport::http::HttpTransport;
