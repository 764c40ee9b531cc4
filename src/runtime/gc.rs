use super::register_file::RegisterFile;

/// The garbage collector as seen from the VM. Tracing happens on the other
/// side of this trait; the VM only pauses, resumes and exposes its roots.
pub trait Collector {
    fn pause(&mut self);
    fn resume(&mut self);

    /// Trace from the register file's roots. Called between `pause` and
    /// `resume`, with every typed shadow reconciled.
    fn collect(&mut self, roots: &RegisterFile) {
        let _ = roots;
    }
}

/// Collector that does nothing. Values are reference counted, so this is the
/// default.
#[derive(Debug, Default)]
pub struct NoopCollector {
    paused: usize,
}

impl NoopCollector {
    pub fn is_paused(&self) -> bool {
        self.paused > 0
    }
}

impl Collector for NoopCollector {
    fn pause(&mut self) {
        self.paused += 1;
    }

    fn resume(&mut self) {
        self.paused = self.paused.saturating_sub(1);
    }
}
