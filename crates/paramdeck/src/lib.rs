//! Dynamic parameter client for template-based workspace creation.
//!
//! A template version declares parameters whose options, defaults and
//! validity depend on each other. The backend evaluates them; this crate
//! keeps a live connection to that evaluation service, reconciles the
//! snapshots it streams back, and builds workspace creation requests from
//! the result.
//!
//! # Layers
//!
//! - [`client`]: one WebSocket per (template version, owner), with a
//!   `Connecting -> Open -> {Closed, Errored}` state machine.
//! - [`session`]: applies snapshots in order, seeds initial values once and
//!   resends the full form state on every edit.
//! - [`view`] and [`flow`]: the create-workspace page on top of a session.
//! - [`api`]: the REST endpoints the flow depends on.

pub mod api;
pub mod autofill;
pub mod client;
pub mod config;
pub mod error;
pub mod external_auth;
pub mod flow;
pub mod names;
pub mod presets;
pub mod protocol;
pub mod session;
pub mod validation;
pub mod view;

pub use api::ApiClient;
pub use client::{ChannelHandler, ConnectionEvent, ConnectionHandle, ConnectionState, DynamicParameterClient, ParameterHandler};
pub use config::ClientConfig;
pub use error::{ClientError, ConnectionError, FormError};
pub use flow::{CreateWorkspaceFlow, FlowOptions, PageQuery};
pub use protocol::{DynamicParametersRequest, DynamicParametersResponse, Inputs, PreviewParameter};
pub use session::{ParameterSession, Reconciler, SessionOptions, SessionView};
pub use view::{CreateWorkspaceForm, CreateWorkspaceMode};
