use bytes::Bytes;
use std::collections::BTreeMap;

/// One in-flight upload fragment: its payload plus the number of ack rounds
///  elapsed since it was last sent.
pub(crate) struct PendingFragment {
    pub data: Bytes,
    pub age: u32,
}

/// Sender-side sliding window for a file upload. At most `window_size`
///  fragments are outstanding (sent but unacknowledged) at once, and each
///  Done/Next round grants a fresh send budget of the same size, shared
///  between newly admitted fragments and retransmissions. A fragment whose
///  age exceeds `max_age` rounds is due for retransmission; its age restarts
///  only when it actually goes out again.
pub(crate) struct SendWindow {
    window_size: usize,
    max_age: u32,
    outstanding: BTreeMap<u16, PendingFragment>,
    budget: usize,
}

impl SendWindow {
    pub fn new(window_size: usize, max_age: u32) -> SendWindow {
        SendWindow {
            window_size,
            max_age,
            outstanding: BTreeMap::new(),
            budget: window_size,
        }
    }

    pub fn has_room(&self) -> bool {
        self.outstanding.len() < self.window_size
    }

    pub fn has_budget(&self) -> bool {
        self.budget > 0
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Admits a freshly read fragment, consuming one unit of send budget.
    pub fn admit(&mut self, fragment_id: u16, data: Bytes) {
        self.outstanding.insert(fragment_id, PendingFragment { data, age: 0 });
        self.budget = self.budget.saturating_sub(1);
    }

    /// Removes every fragment the receiver reported.
    pub fn acknowledge(&mut self, fragment_ids: &[u16]) {
        for fragment_id in fragment_ids {
            self.outstanding.remove(fragment_id);
        }
    }

    /// Starts a new ack round, refilling the send budget.
    pub fn start_round(&mut self) {
        self.budget = self.window_size;
    }

    /// Ages every outstanding fragment and returns the ones due for
    ///  retransmission, oldest ids first, as far as the budget allows. The
    ///  returned fragments count as sent: age reset, budget consumed.
    pub fn age_round(&mut self) -> Vec<(u16, Bytes)> {
        let mut due = Vec::new();
        for (fragment_id, fragment) in self.outstanding.iter_mut() {
            fragment.age += 1;
            if fragment.age > self.max_age && self.budget > 0 {
                fragment.age = 0;
                self.budget -= 1;
                due.push((*fragment_id, fragment.data.clone()));
            }
        }
        due
    }
}
