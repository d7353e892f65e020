//! Round-robin load balancing strategy.

use std::sync::{Mutex, PoisonError};

use crate::load_balancer::LoadBalancer;

/// Round-robin selector filtered by usability.
///
/// The cursor only moves when a candidate is returned: it lands one past
/// the chosen index, so skipped candidates are tried first next time.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn next_index(&self, len: usize, usable: &dyn Fn(usize) -> bool) -> Option<usize> {
        if len == 0 {
            return None;
        }

        let mut cursor = self.cursor.lock().unwrap_or_else(PoisonError::into_inner);
        let start = *cursor % len;
        let index = (0..len).map(|i| (start + i) % len).find(|&i| usable(i))?;
        *cursor = (index + 1) % len;
        Some(index)
    }
}
