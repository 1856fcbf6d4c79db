//! Injectable I/O failures for exercising error paths

use parking_lot::Mutex;
use std::io;

use crate::error::{IndexError, Result};

/// Directory operation a fault can be attached to
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Create,
    Write,
    Open,
    Delete,
    Rename,
    Sync,
}

#[derive(Clone, Debug)]
struct FaultRule {
    op: FaultOp,
    /// Matches file names starting with this prefix; empty matches all
    prefix: String,
    /// Remaining firings, `None` fires forever
    remaining: Option<usize>,
}

/// Shared set of fault rules consulted by a directory before each operation
#[derive(Debug, Default)]
pub struct FaultInjector {
    rules: Mutex<Vec<FaultRule>>,
    fired: Mutex<Vec<(FaultOp, String)>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail `op` on files starting with `prefix` every time
    pub fn fail_always(&self, op: FaultOp, prefix: impl Into<String>) {
        self.rules.lock().push(FaultRule {
            op,
            prefix: prefix.into(),
            remaining: None,
        });
    }

    /// Fail `op` on files starting with `prefix` for the next `times` calls
    pub fn fail_times(&self, op: FaultOp, prefix: impl Into<String>, times: usize) {
        self.rules.lock().push(FaultRule {
            op,
            prefix: prefix.into(),
            remaining: Some(times),
        });
    }

    pub fn clear(&self) {
        self.rules.lock().clear();
    }

    /// Operations that were failed so far
    pub fn fired(&self) -> Vec<(FaultOp, String)> {
        self.fired.lock().clone()
    }

    pub(crate) fn check(&self, op: FaultOp, name: &str) -> Result<()> {
        let mut rules = self.rules.lock();
        let hit = rules.iter_mut().find(|rule| {
            rule.op == op
                && name.starts_with(rule.prefix.as_str())
                && rule.remaining.map_or(true, |n| n > 0)
        });
        let Some(rule) = hit else {
            return Ok(());
        };
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        rules.retain(|rule| rule.remaining != Some(0));
        drop(rules);

        self.fired.lock().push((op, name.to_string()));
        Err(IndexError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("injected {:?} failure on {}", op, name),
        )))
    }
}
