//! Task Messenger: a manager/worker dispatch fabric.
//!
//! A central manager accepts long-lived connections from a fleet of
//! workers and streams framed task messages to them; workers execute each
//! task through a typed skill handler and return a framed response. The
//! transport and session machinery lives in `task-messenger-net` on top of
//! the `task-messenger-core` reactor; this crate supplies configuration,
//! the skill registry, response sinks, and the `manager`/`worker`
//! binaries.

pub mod config;
pub mod logging;
pub mod sink;
pub mod skills;

pub use config::{
    ConfigError, FileConfig, ManagerArgs, ManagerConfig, WorkerArgs, WorkerConfig, WorkerMode,
    resolve_manager, resolve_worker,
};
pub use sink::{CollectSink, LogSink};
pub use skills::{SkillHandler, SkillRegistry, skill_ids};
