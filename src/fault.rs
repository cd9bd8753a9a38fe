//! Per-path fault injection for protocol testing.
//!
//! A directive installed for a path is consumed on request dispatch: each
//! matching request rolls against `probability` and, on a hit, burns one
//! count and applies the configured effects. Injected failures are
//! indistinguishable from real ones to callers; the countdown bounds how
//! many requests can be affected.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// Effects a consumed directive applies to the request.
#[derive(Debug, Clone)]
pub struct FaultDirective {
    /// Respond with this status instead of handling the request.
    pub status: Option<u16>,
    /// Sleep before handling.
    pub delay: Option<Duration>,
    /// Flip bytes in the response body.
    pub corrupt_body: bool,
    /// Inject an extra SSE data event with this payload before real data.
    pub inject_sse_event: Option<String>,
    /// Terminate the response body mid-flight.
    pub drop_connection: bool,
    /// How many requests may consume this directive before it is removed.
    pub remaining: u32,
    /// Chance in [0, 1] that a matching request consumes a count.
    pub probability: f64,
}

impl Default for FaultDirective {
    fn default() -> Self {
        Self {
            status: None,
            delay: None,
            corrupt_body: false,
            inject_sse_event: None,
            drop_connection: false,
            remaining: 1,
            probability: 1.0,
        }
    }
}

/// Registry of pending directives, keyed by stream path.
#[derive(Default)]
pub struct FaultInjector {
    directives: Mutex<HashMap<String, FaultDirective>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or replace) the directive for a path.
    pub fn install(&self, path: &str, directive: FaultDirective) {
        self.directives
            .lock()
            .insert(path.to_string(), directive);
    }

    /// Remove any directive for a path.
    pub fn clear(&self, path: &str) {
        self.directives.lock().remove(path);
    }

    /// Consume one count for a request against `path`, if a directive is
    /// installed and the probability roll hits. The returned copy carries
    /// the effects to apply.
    pub fn take(&self, path: &str) -> Option<FaultDirective> {
        let mut directives = self.directives.lock();
        let directive = directives.get_mut(path)?;

        if directive.probability < 1.0 {
            let roll: f64 = rand::thread_rng().gen();
            if roll >= directive.probability {
                return None;
            }
        }

        let fired = directive.clone();
        directive.remaining = directive.remaining.saturating_sub(1);
        if directive.remaining == 0 {
            directives.remove(path);
        }
        Some(fired)
    }
}

/// Corrupt a response body in place: flip the low bit of every 7th byte.
pub fn corrupt(body: &mut [u8]) {
    for byte in body.iter_mut().step_by(7) {
        *byte ^= 0x01;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_countdown_removes_directive() {
        let faults = FaultInjector::new();
        faults.install(
            "/t",
            FaultDirective {
                status: Some(503),
                remaining: 2,
                ..Default::default()
            },
        );

        assert!(faults.take("/t").is_some());
        assert!(faults.take("/t").is_some());
        assert!(faults.take("/t").is_none());
    }

    #[test]
    fn test_zero_probability_never_fires() {
        let faults = FaultInjector::new();
        faults.install(
            "/t",
            FaultDirective {
                probability: 0.0,
                ..Default::default()
            },
        );
        for _ in 0..20 {
            assert!(faults.take("/t").is_none());
        }
    }

    #[test]
    fn test_other_paths_unaffected() {
        let faults = FaultInjector::new();
        faults.install("/t", FaultDirective::default());
        assert!(faults.take("/other").is_none());
        assert!(faults.take("/t").is_some());
    }

    #[test]
    fn test_corrupt_changes_bytes() {
        let mut body = b"hello world, hello world".to_vec();
        let original = body.clone();
        corrupt(&mut body);
        assert_ne!(body, original);
        assert_eq!(body.len(), original.len());
    }
}
