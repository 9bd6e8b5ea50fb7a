// crates/mediaflow-engine/src/signal.rs
//
// A plain wakeup bell: decoders call `notify()` when their upstream packet
// queue runs dry so the reader's backpressure wait can resume early instead
// of sitting out its full timeout.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct Signal {
    mutex: Mutex<()>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Signal { mutex: Mutex::new(()), cond: Condvar::new() }
    }

    pub fn notify(&self) {
        let _g = self.mutex.lock().unwrap();
        self.cond.notify_all();
    }

    pub fn wait_timeout(&self, timeout: Duration) {
        let g = self.mutex.lock().unwrap();
        let _ = self.cond.wait_timeout(g, timeout).unwrap();
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}
