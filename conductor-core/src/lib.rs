//! # Conductor Core
//!
//! Coordination kernel for a fleet of agent sessions working on a shared
//! task graph.
//!
//! ## Architecture
//!
//! - **Task Graph**: per-project forest of tasks with acyclic dependencies
//! - **Sessions**: kernel-owned lifecycle state machine with terminal cascades
//! - **Queue**: per-session FIFO of task assignments, one active item at most
//! - **Mailbox**: direct and broadcast messages with delivery tracking
//! - **Event Bus**: synchronous in-process pub/sub with bounded history
//! - **Notification Bridge**: scoped fan-out and replay for observers
//!
//! All components share one [`KernelContext`]: a persistence port
//! ([`conductor_traits::Store`]), an injected event bus, the configuration
//! and the lock table. [`Kernel`] wires them together.

pub use conductor_traits::{EntityKind, Filter, Store, StoreError};
pub use conductor_types::*;

pub mod error;

// Configuration - defaults, TOML file, CONDUCTOR_* environment
pub mod config;

// Domain events and the bus that carries them
pub mod events;
pub mod event_bus;

// Who may do what
pub mod capability;

// Cascade gate and per-entity locks
pub mod locks;

pub mod context;

pub mod task;
pub mod session;
pub mod queue;
pub mod mailbox;
pub mod bridge;

pub mod kernel;

pub use bridge::{NotificationBridge, Observer, ObserverScope};
pub use context::KernelContext;
pub use error::{ErrorCategory, KernelError, Result};
pub use event_bus::{EventBus, EventBusExt, MemoryEventBus, Subscription};
pub use events::{EventEnvelope, KernelEvent};
pub use kernel::Kernel;
pub use mailbox::Mailbox;
pub use queue::{QueueEngine, QueueTransition};
pub use session::{SessionManager, STOPPED_TASK_STATUS};
pub use task::TaskGraph;
