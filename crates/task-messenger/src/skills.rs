//! Skill registry: maps `skill_id`s to executable handlers.

use std::collections::HashMap;

use bytes::Bytes;
use task_messenger_net::SkillDispatcher;
use tracing::warn;

/// Well-known skill ids registered by the worker binary.
pub mod skill_ids {
    /// Byte-reverse the payload.
    pub const REVERSE: u32 = 1;
    /// Return the payload unchanged.
    pub const ECHO: u32 = 2;
    /// ASCII-uppercase the payload.
    pub const UPPERCASE: u32 = 3;
}

/// One executable skill.
pub trait SkillHandler: Send + Sync {
    /// Execute the task and produce the response payload.
    fn invoke(&self, task_id: u32, payload: Bytes) -> Bytes;
}

impl<F> SkillHandler for F
where
    F: Fn(u32, Bytes) -> Bytes + Send + Sync,
{
    fn invoke(&self, task_id: u32, payload: Bytes) -> Bytes {
        self(task_id, payload)
    }
}

/// Registry of skill handlers, dispatched by `skill_id`.
///
/// An unknown `skill_id` produces an empty response payload; the task id
/// still echoes back so the manager can account for it.
#[derive(Default)]
pub struct SkillRegistry {
    handlers: HashMap<u32, Box<dyn SkillHandler>>,
}

impl SkillRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in skills registered.
    pub fn with_builtin_skills() -> Self {
        let mut registry = Self::new();
        registry.register(skill_ids::REVERSE, |_task_id, payload: Bytes| {
            let mut bytes = payload.to_vec();
            bytes.reverse();
            Bytes::from(bytes)
        });
        registry.register(skill_ids::ECHO, |_task_id, payload: Bytes| payload);
        registry.register(skill_ids::UPPERCASE, |_task_id, payload: Bytes| {
            Bytes::from(payload.to_ascii_uppercase())
        });
        registry
    }

    /// Register (or replace) the handler for a skill id.
    pub fn register(&mut self, skill_id: u32, handler: impl SkillHandler + 'static) {
        self.handlers.insert(skill_id, Box::new(handler));
    }

    /// Whether a handler is registered for the skill id.
    pub fn contains(&self, skill_id: u32) -> bool {
        self.handlers.contains_key(&skill_id)
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl SkillDispatcher for SkillRegistry {
    fn dispatch(&self, task_id: u32, skill_id: u32, payload: Bytes) -> Bytes {
        match self.handlers.get(&skill_id) {
            Some(handler) => handler.invoke(task_id, payload),
            None => {
                warn!(task_id, skill_id, "no handler registered for skill");
                Bytes::new()
            }
        }
    }
}
