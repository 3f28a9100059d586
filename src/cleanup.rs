//! Deferred-release stack for mounts, crypto mappings and temp directories.
//!
//! Every resource acquired during a run registers its release here; the
//! stack drains in last-registered-first order once the run is over,
//! whether it succeeded or failed. The LIFO guarantee is load-bearing:
//! the orchestrator pushes the disk-sync job first precisely so it runs
//! after every mount point has been released.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, warn};

struct Job {
    what: String,
    run: Box<dyn FnOnce() -> Result<()>>,
}

/// Ordered stack of cleanup jobs. Cloning yields a handle to the same
/// stack, so the orchestrator and both `FileSystem` instances can push
/// onto one shared instance. Single-threaded by design.
#[derive(Clone, Default)]
pub struct Cleaner {
    jobs: Rc<RefCell<Vec<Job>>>,
}

impl Cleaner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a cleanup job. Jobs run in reverse registration order.
    pub fn push<F>(&self, what: impl Into<String>, job: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let what = what.into();
        debug!("cleanup job registered: {what}");
        self.jobs.borrow_mut().push(Job {
            what,
            run: Box::new(job),
        });
    }

    /// Number of jobs currently registered.
    pub fn len(&self) -> usize {
        self.jobs.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.borrow().is_empty()
    }

    /// Pop and run exactly the most recently registered job.
    ///
    /// Used to restore the process umask right after the passphrase file
    /// has been written, instead of leaving the tightened umask in place
    /// until the final unwind.
    pub fn drain_one(&self) -> Result<()> {
        let job = self.jobs.borrow_mut().pop();
        match job {
            Some(job) => {
                debug!("cleanup (early): {}", job.what);
                (job.run)()
            }
            None => bail!("drain_one called on an empty cleanup stack"),
        }
    }

    /// Pop and run every job, most recent first.
    ///
    /// A failing job does not stop the drain: leaving mounts or an open
    /// crypto mapping behind is worse than a secondary error, so the
    /// remaining jobs still run and all failures are reported together.
    pub fn drain_all(&self) -> Result<()> {
        let mut failures: Vec<String> = Vec::new();

        loop {
            let job = self.jobs.borrow_mut().pop();
            let Some(job) = job else { break };

            debug!("cleanup: {}", job.what);
            if let Err(err) = (job.run)() {
                warn!("cleanup job '{}' failed: {err:#}", job.what);
                failures.push(format!("{}: {err:#}", job.what));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{} cleanup job(s) failed:\n  {}", failures.len(), failures.join("\n  "));
        }
    }
}
