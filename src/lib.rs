// Library modules
pub mod bus;
pub mod client;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod discovery;
pub mod error;
pub mod event;
pub mod input;
pub mod net;
pub mod protocol;
pub mod screen;
pub mod server;
pub mod transfer;

// Re-export commonly used types
pub use client::{Client, ClientCapabilities};
pub use config::{AppConfig, ClientConfig, ClientEntry, ServerConfig, StreamSettings};
pub use daemon::{Daemon, DaemonState};
pub use event::{BusEvent, EventBus, EventKind};
pub use protocol::{Message, MessageBuilder, MessageType};
pub use screen::{ScreenPosition, Transition, TransitionController};
pub use server::{Server, ServerCapabilities};
pub use transfer::FileCoordinator;
