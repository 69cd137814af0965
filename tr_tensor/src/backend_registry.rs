//! Named backend factories, their priorities and initialised instances.

use std::collections::HashMap;

use log::warn;

use crate::backend::{Backend, BackendFactory};

/// Lifecycle of one registered backend name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Registered,
    Initializing,
    Ready,
    Failed,
}

struct Registration {
    factory: BackendFactory,
    priority: i32,
    state: BackendState,
    /// Registration sequence number; breaks priority ties deterministically.
    seq: usize,
}

#[derive(Default)]
pub struct BackendRegistry {
    registrations: HashMap<String, Registration>,
    instances: HashMap<String, Box<dyn Backend>>,
    next_seq: usize,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory. An existing name keeps its factory and the call returns false.
    pub fn register(&mut self, name: &str, factory: BackendFactory, priority: i32) -> bool {
        if self.registrations.contains_key(name) {
            warn!("{name} backend was already registered; reusing existing backend factory");
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.registrations.insert(
            name.to_string(),
            Registration {
                factory,
                priority,
                state: BackendState::Registered,
                seq,
            },
        );
        true
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn factory(&self, name: &str) -> Option<BackendFactory> {
        self.registrations.get(name).map(|r| r.factory.clone())
    }

    pub fn priority(&self, name: &str) -> Option<i32> {
        self.registrations.get(name).map(|r| r.priority)
    }

    pub fn state(&self, name: &str) -> Option<BackendState> {
        self.registrations.get(name).map(|r| r.state)
    }

    pub fn set_state(&mut self, name: &str, state: BackendState) {
        if let Some(registration) = self.registrations.get_mut(name) {
            registration.state = state;
        }
    }

    /// Registered names in descending priority; ties keep registration order.
    pub fn sorted_names(&self) -> Vec<String> {
        let mut names: Vec<(&String, &Registration)> = self.registrations.iter().collect();
        names.sort_by(|(_, a), (_, b)| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        names.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Store a ready instance, replacing (and returning) any previous one.
    pub fn install(&mut self, name: &str, backend: Box<dyn Backend>) -> Option<Box<dyn Backend>> {
        self.set_state(name, BackendState::Ready);
        self.instances.insert(name.to_string(), backend)
    }

    pub fn instance(&self, name: &str) -> Option<&dyn Backend> {
        self.instances.get(name).map(|b| b.as_ref())
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut dyn Backend> {
        match self.instances.get_mut(name) {
            Some(b) => Some(b.as_mut()),
            None => None,
        }
    }

    pub fn has_instance(&self, name: &str) -> bool {
        self.instances.contains_key(name)
    }

    pub fn take_instance(&mut self, name: &str) -> Option<Box<dyn Backend>> {
        let instance = self.instances.remove(name);
        if instance.is_some() {
            self.set_state(name, BackendState::Registered);
        }
        instance
    }

    pub fn instance_names(&self) -> Vec<String> {
        self.instances.keys().cloned().collect()
    }

    /// Forget the registration; the caller is responsible for the instance.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.registrations.remove(name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendInit;
    use crate::error::Error;
    use std::rc::Rc;

    fn failing() -> BackendFactory {
        Rc::new(|| -> crate::Result<BackendInit> { Err(Error::Backend("no device".into())) })
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = BackendRegistry::new();
        assert!(registry.register("a", failing(), 1));
        assert!(!registry.register("a", failing(), 100));
        assert_eq!(registry.priority("a"), Some(1));
        assert_eq!(registry.state("a"), Some(BackendState::Registered));
    }

    #[test]
    fn test_sorted_by_priority_then_registration_order() {
        let mut registry = BackendRegistry::new();
        registry.register("low", failing(), 1);
        registry.register("tie-first", failing(), 5);
        registry.register("high", failing(), 10);
        registry.register("tie-second", failing(), 5);
        assert_eq!(
            registry.sorted_names(),
            vec!["high", "tie-first", "tie-second", "low"]
        );
    }
}
