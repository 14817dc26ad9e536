use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Short-TTL record of already-claimed inbound message ids.
///
/// Meta redelivers a webhook event when the 2xx acknowledgement is slow or
/// missing; retries land within seconds, so an in-process window with a 60s
/// TTL collapses them. The claim is an insert-if-absent under one lock —
/// exactly one of any set of concurrent callers for the same id observes
/// `false` and owns the message. Entries are reclaimed by a background
/// sweeper, never synchronously on the request path.
pub struct DedupWindow {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        })
    }

    /// Returns `false` exactly once per id within the TTL (the caller that
    /// gets `false` owns the message); `true` for every duplicate.
    pub fn seen(&self, message_id: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(message_id) {
            Some(expiry) if *expiry > now => true,
            _ => {
                entries.insert(message_id.to_string(), now + self.ttl);
                false
            }
        }
    }

    /// Spawn the eviction task. Dropping the returned handle does not stop
    /// it; callers keep it for shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let window = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                window.sweep();
            }
        })
    }

    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, expiry| *expiry > now);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
