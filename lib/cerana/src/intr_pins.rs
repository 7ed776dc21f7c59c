// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A line into the guest's interrupt controller.
///
/// The para-pass-through model mostly leaves interrupt delivery to the
/// physical controller; pins are used where the emulation must synthesize
/// or suppress an interrupt itself.
pub trait IntrPin: Send + Sync + 'static {
    fn assert(&self);
    fn deassert(&self);
    fn is_asserted(&self) -> bool;
    fn pulse(&self) {
        self.assert();
        self.deassert();
    }
    fn set_state(&self, active: bool) {
        if active {
            self.assert();
        } else {
            self.deassert();
        }
    }
}

/// A free-standing pin which simply latches its state.  Used in tests and
/// as a sink where no interrupt routing is wired up.
#[derive(Default)]
pub struct LatchPin {
    asserted: AtomicBool,
}

impl LatchPin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { asserted: AtomicBool::new(false) })
    }
}

impl IntrPin for LatchPin {
    fn assert(&self) {
        self.asserted.store(true, Ordering::SeqCst);
    }
    fn deassert(&self) {
        self.asserted.store(false, Ordering::SeqCst);
    }
    fn is_asserted(&self) -> bool {
        self.asserted.load(Ordering::SeqCst)
    }
}
