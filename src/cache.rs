use crate::backends::Quality;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct CachedAudio {
    pub audio: Arc<Vec<u8>>,
    pub duration_ms: u64,
    pub engine: String,
    pub quality: Quality,
    pub voice_id_used: String,
}

type CacheKey = (String, String);

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CachedAudio>,
    order: VecDeque<CacheKey>,
}

/// Bounded in-process cache of synthesized audio keyed by (text, generic voice).
/// Oldest entries are evicted first; nothing survives a restart.
pub struct AudioCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl AudioCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    pub fn get(&self, text: &str, voice: &str) -> Option<CachedAudio> {
        if self.capacity == 0 {
            return None;
        }
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .entries
            .get(&(text.to_string(), voice.to_string()))
            .cloned()
    }

    pub fn insert(&self, text: &str, voice: &str, audio: CachedAudio) {
        if self.capacity == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let key = (text.to_string(), voice.to_string());
        if inner.entries.insert(key.clone(), audio).is_none() {
            inner.order.push_back(key);
        }
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(engine: &str) -> CachedAudio {
        CachedAudio {
            audio: Arc::new(vec![1, 2, 3]),
            duration_ms: 120,
            engine: engine.to_string(),
            quality: Quality::High,
            voice_id_used: "en-US-JennyNeural".to_string(),
        }
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = AudioCache::new(4);
        cache.insert("Hello", "american_female_professional", audio("edge"));
        assert!(cache.get("Hello", "american_female_professional").is_some());
        assert!(cache.get("Hello", "british_male_authoritative").is_none());
    }

    #[test]
    fn test_evicts_oldest() {
        let cache = AudioCache::new(2);
        cache.insert("a", "v", audio("edge"));
        cache.insert("b", "v", audio("edge"));
        cache.insert("c", "v", audio("edge"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", "v").is_none());
        assert!(cache.get("c", "v").is_some());
    }

    #[test]
    fn test_zero_capacity_disables() {
        let cache = AudioCache::new(0);
        cache.insert("a", "v", audio("edge"));
        assert!(cache.is_empty());
        assert!(cache.get("a", "v").is_none());
    }
}
