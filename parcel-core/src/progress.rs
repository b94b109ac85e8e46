//! Shared progress handles for resource transfers.
//!
//! A handle either counts its own units (leaf, updated by the transport) or aggregates
//! children, each weighted by a number of the parent's units. Cancellation is advisory:
//! it flags the handle and its children; the transport decides what to do with it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::lock;

#[derive(Debug, Clone)]
pub struct Progress {
    inner: Arc<ProgressInner>,
}

#[derive(Debug)]
struct ProgressInner {
    total: AtomicU64,
    completed: AtomicU64,
    cancelled: AtomicBool,
    children: Mutex<Vec<(Progress, u64)>>,
}

impl Progress {
    pub fn new(total_units: u64) -> Self {
        Self {
            inner: Arc::new(ProgressInner {
                total: AtomicU64::new(total_units),
                completed: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn total_units(&self) -> u64 {
        self.inner.total.load(Ordering::Acquire)
    }

    pub fn set_total_units(&self, units: u64) {
        self.inner.total.store(units, Ordering::Release);
    }

    /// Units completed directly on this handle (children not included).
    pub fn completed_units(&self) -> u64 {
        self.inner.completed.load(Ordering::Acquire)
    }

    pub fn set_completed_units(&self, units: u64) {
        self.inner.completed.store(units, Ordering::Release);
    }

    /// Attach `child` so that its completion accounts for `pending_units` of this handle.
    pub fn add_child(&self, child: Progress, pending_units: u64) {
        if self.is_cancelled() {
            child.cancel();
        }
        lock(&self.inner.children).push((child, pending_units));
    }

    pub fn child_count(&self) -> usize {
        lock(&self.inner.children).len()
    }

    /// Fraction in `0.0..=1.0`, combining own units and weighted children.
    pub fn fraction_completed(&self) -> f64 {
        let total = self.total_units();
        if total == 0 {
            return 0.0;
        }
        let children: f64 = lock(&self.inner.children)
            .iter()
            .map(|(child, weight)| child.fraction_completed() * *weight as f64)
            .sum();
        let done = self.completed_units() as f64 + children;
        (done / total as f64).min(1.0)
    }

    pub fn is_finished(&self) -> bool {
        self.total_units() > 0 && self.fraction_completed() >= 1.0
    }

    /// Flag this handle and every child as cancelled.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        let children: Vec<Progress> = lock(&self.inner.children)
            .iter()
            .map(|(child, _)| child.clone())
            .collect();
        for child in children {
            child.cancel();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}
