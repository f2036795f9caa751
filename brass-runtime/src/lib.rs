//! # Brass Runtime
//!
//! A single-threaded effect runtime. Programs are values of type
//! [`Effect<R, E, A>`]: descriptions that need an environment `R`, may fail
//! with `E` and succeed with `A`. Nothing happens until a [`Runtime`] forks
//! them into fibers.
//!
//! The runtime provides:
//!
//! - **Effects**: six primitive constructors plus derived combinators
//! - **Fibers**: a trampolined interpreter with typed exits and interruption
//! - **Scheduler**: one FIFO run queue with an opcode budget per step
//! - **Scopes**: structured concurrency with LIFO finalizers
//! - **Combinators**: race, zip_par, collect_all_par, race_with, timeout
//! - **Timers and blocking**: sleep on a timer queue, offload to threads
//! - **Queues and streams**: back-pressured queues and pull streams
//! - **Observability**: lifecycle hooks with tracing, bus and registry sinks
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BRASS RUNTIME                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │    Effect    │  │    Fiber     │  │  Scheduler   │          │
//! │  │ (effect.rs)  │─►│  (fiber.rs)  │─►│(scheduler.rs)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                 │                 ▲                   │
//! │         ▼                 ▼                 │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │ Concurrency  │─►│    Scope     │  │    Driver    │          │
//! │  │(race, zip..) │  │  (scope.rs)  │  │timers/bridge │          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │         │                                   │                   │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐          │
//! │  │Queue / Stream│  │   Runtime    │  │    Hooks     │          │
//! │  │              │  │ (runtime.rs) │─►│(events, obs.)│          │
//! │  └──────────────┘  └──────────────┘  └──────────────┘          │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use brass_runtime::{race, Effect, Exit, Runtime};
//!
//! let rt = Runtime::new(());
//! let scope = rt.scope();
//! let slow = rt.delay(Duration::from_millis(50), Effect::<(), String, _>::succeed("slow"));
//! let fast = rt.delay(Duration::from_millis(5), Effect::succeed("fast"));
//! assert_eq!(rt.block_on(race(slow, fast, &scope))?, Exit::Success("fast"));
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod cause;
pub mod completion;
pub mod concurrency;
pub mod config;
mod continuation;
mod driver;
pub mod effect;
pub mod error;
pub mod events;
pub mod fiber;
pub mod fork_policy;
pub mod observability;
pub mod panic;
pub mod queue;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod stream;

// Re-exports
pub use cause::{Cause, Exit, ExitKind, ScopeExit};
pub use completion::{Canceler, Completion};
pub use concurrency::{acquire_release, collect_all_par, race, race_with, timeout, zip_par};
pub use config::{ClockMode, ConfigError, LogLevel, RuntimeConfig, RuntimeConfigBuilder};
pub use effect::Effect;
pub use error::{RuntimeError, ScopeError};
pub use events::{EmitContext, NoopHooks, RuntimeEvent, RuntimeHooks};
pub use fiber::{Fiber, FiberId, FiberStatus, RunState};
pub use fork_policy::{FiberMeta, ForkPolicy, IdGenerator, TraceContext, XorShiftIds};
pub use observability::{CompositeHooks, EventBus, EventRecord, Registry, TracingHooks};
pub use panic::Defect;
pub use queue::{Queue, QueueError, Strategy};
pub use runtime::{Runtime, RuntimeBuilder};
pub use scheduler::{Scheduler, SchedulerStats};
pub use scope::{CloseOptions, Scope, ScopeId};
pub use stream::{Pull, Stream};

/// Runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
