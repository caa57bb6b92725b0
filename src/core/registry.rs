//! Instance registry - Advisory ownership of emulator instances by bots
//!
//! The registry only gates *assignment*. Device operations never consult it,
//! so a caller that skips reservation can still drive an instance another bot
//! owns.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Maps instance name to the id of the bot that holds it
#[derive(Debug, Default)]
pub struct InstanceRegistry {
    held_by: Mutex<HashMap<String, String>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, String>> {
        // The table holds plain strings; a panic mid-update cannot leave it torn.
        self.held_by.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `instance` for `bot_id`. A blank instance never takes part in
    /// locking and always succeeds.
    pub fn try_reserve(&self, instance: &str, bot_id: &str) -> bool {
        if instance.trim().is_empty() {
            return true;
        }

        let mut table = self.table();
        match table.get(instance) {
            Some(holder) => holder == bot_id,
            None => {
                table.insert(instance.to_string(), bot_id.to_string());
                true
            }
        }
    }

    /// Drop every reservation held by `bot_id`
    pub fn release_by_bot(&self, bot_id: &str) {
        self.table().retain(|_, holder| holder != bot_id);
    }

    /// Replace the whole table from an authoritative list of
    /// `(instance, bot_id)` pairs. The first bot seen for an instance wins.
    pub fn rebuild_from_bots<I, S, T>(&self, pairs: I)
    where
        I: IntoIterator<Item = (S, T)>,
        S: AsRef<str>,
        T: AsRef<str>,
    {
        let mut rebuilt = HashMap::new();
        for (instance, bot_id) in pairs {
            let instance = instance.as_ref();
            if instance.trim().is_empty() {
                continue;
            }
            rebuilt
                .entry(instance.to_string())
                .or_insert_with(|| bot_id.as_ref().to_string());
        }
        *self.table() = rebuilt;
    }

    /// Current holder of `instance`, if any
    pub fn owner(&self, instance: &str) -> Option<String> {
        self.table().get(instance).cloned()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn blank_instance_opts_out_of_locking() {
        let registry = InstanceRegistry::new();
        assert!(registry.try_reserve("", "bot1"));
        assert!(registry.try_reserve("   ", "bot2"));
        assert!(registry.is_empty());
    }

    #[test]
    fn second_bot_is_refused_without_mutation() {
        let registry = InstanceRegistry::new();
        assert!(registry.try_reserve("LDPlayer-0", "bot1"));
        assert!(registry.try_reserve("LDPlayer-0", "bot1"));
        assert!(!registry.try_reserve("LDPlayer-0", "bot2"));
        assert_eq!(registry.owner("LDPlayer-0").as_deref(), Some("bot1"));
    }

    #[test]
    fn release_frees_every_instance_of_the_bot() {
        let registry = InstanceRegistry::new();
        assert!(registry.try_reserve("A", "bot1"));
        assert!(registry.try_reserve("B", "bot1"));
        assert!(registry.try_reserve("C", "bot3"));

        registry.release_by_bot("bot1");

        assert!(registry.try_reserve("A", "bot2"));
        assert!(registry.try_reserve("B", "bot2"));
        assert_eq!(registry.owner("C").as_deref(), Some("bot3"));
    }

    #[test]
    fn rebuild_keeps_first_owner_and_skips_blank() {
        let registry = InstanceRegistry::new();
        registry.try_reserve("stale", "bot9");

        registry.rebuild_from_bots([("A", "bot1"), ("A", "bot2"), ("", "bot3")]);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.owner("A").as_deref(), Some("bot1"));
        assert!(registry.owner("stale").is_none());
    }

    #[test]
    fn concurrent_reservations_have_one_winner() {
        let registry = Arc::new(InstanceRegistry::new());
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    scope.spawn(move || registry.try_reserve("shared", &format!("bot{}", i)))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| usize::from(h.join().unwrap()))
                .sum()
        });
        assert_eq!(winners, 1);
    }
}
