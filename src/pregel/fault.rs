//! Fault injection for failure and recovery tests
//!
//! Workers and the transport ask the shared [`FaultInjector`] before the
//! operation each fault targets. A fault fires a bounded number of times.

use std::sync::Mutex;

use super::partition::WorkerId;

/// A failure to provoke
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The worker stops responding when asked to run `superstep`
    CrashWorker { worker: WorkerId, superstep: u64 },
    /// A vertex compute on the worker returns an error in `superstep`
    FailCompute { worker: WorkerId, superstep: u64 },
    /// Batches produced in `superstep` addressed to `target` fail to deliver
    DropBatches { target: WorkerId, superstep: u64 },
    /// The worker's checkpoint write for `superstep` fails
    FailCheckpointWrite { worker: WorkerId, superstep: u64 },
}

impl Fault {
    pub fn name(&self) -> &'static str {
        match self {
            Fault::CrashWorker { .. } => "crash_worker",
            Fault::FailCompute { .. } => "fail_compute",
            Fault::DropBatches { .. } => "drop_batches",
            Fault::FailCheckpointWrite { .. } => "fail_checkpoint_write",
        }
    }
}

#[derive(Debug)]
struct Rule {
    fault: Fault,
    remaining: u64,
    fired: u64,
}

/// Shared registry of armed faults
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<Rule>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a fault that fires once
    pub fn inject(&self, fault: Fault) {
        self.inject_times(fault, 1);
    }

    /// Arm a fault that fires `times` times
    pub fn inject_times(&self, fault: Fault, times: u64) {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.push(Rule {
            fault,
            remaining: times,
            fired: 0,
        });
    }

    /// Consume one firing of `fault` if it is armed
    pub fn trigger(&self, fault: &Fault) -> bool {
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        match rules.iter_mut().find(|r| r.fault == *fault && r.remaining > 0) {
            Some(rule) => {
                rule.remaining -= 1;
                rule.fired += 1;
                tracing::warn!(fault = fault.name(), ?fault, "injecting fault");
                true
            }
            None => false,
        }
    }

    /// How often `fault` has fired
    pub fn fired_count(&self, fault: &Fault) -> u64 {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.iter().filter(|r| r.fault == *fault).map(|r| r.fired).sum()
    }

    pub fn total_fired(&self) -> u64 {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.iter().map(|r| r.fired).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_fires_bounded_times() {
        let injector = FaultInjector::new();
        let crash = Fault::CrashWorker {
            worker: WorkerId(1),
            superstep: 3,
        };
        injector.inject_times(crash, 2);

        assert!(!injector.trigger(&Fault::CrashWorker {
            worker: WorkerId(1),
            superstep: 2
        }));
        assert!(injector.trigger(&crash));
        assert!(injector.trigger(&crash));
        assert!(!injector.trigger(&crash));
        assert_eq!(injector.fired_count(&crash), 2);
        assert_eq!(injector.total_fired(), 2);
    }

    #[test]
    fn test_unarmed_fault_never_fires() {
        let injector = FaultInjector::new();
        let drop = Fault::DropBatches {
            target: WorkerId(0),
            superstep: 0,
        };
        assert!(!injector.trigger(&drop));
        assert_eq!(injector.fired_count(&drop), 0);
        assert_eq!(drop.name(), "drop_batches");
    }
}
