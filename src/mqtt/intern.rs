//! Topic interning: each distinct topic string maps to a small handle, and
//! handles are what connection maps are keyed on.
//!
//! Handles of released topics are reused, so a key must not outlive the
//! last stream that holds it.

use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use twox_hash::XxHash64;

type XxBuildHasher = BuildHasherDefault<XxHash64>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(u32);

#[derive(Debug, Default)]
pub struct TopicInterner {
    keys: HashMap<String, TopicKey, XxBuildHasher>,
    names: Vec<Option<String>>,
    free: Vec<u32>,
}

impl TopicInterner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, topic: &str) -> TopicKey {
        if let Some(key) = self.keys.get(topic) {
            return *key;
        }
        let key = match self.free.pop() {
            Some(index) => {
                self.names[index as usize] = Some(topic.to_string());
                TopicKey(index)
            }
            None => {
                self.names.push(Some(topic.to_string()));
                TopicKey(self.names.len() as u32 - 1)
            }
        };
        self.keys.insert(topic.to_string(), key);
        key
    }

    pub fn get(&self, topic: &str) -> Option<TopicKey> {
        self.keys.get(topic).copied()
    }

    pub fn name(&self, key: TopicKey) -> Option<&str> {
        self.names.get(key.0 as usize).and_then(Option::as_deref)
    }

    /// Forget `key` once nothing refers to it any more.
    pub fn release(&mut self, key: TopicKey) {
        if let Some(name) = self.names.get_mut(key.0 as usize).and_then(Option::take) {
            self.keys.remove(&name);
            self.free.push(key.0);
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}
