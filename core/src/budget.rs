//! Hierarchical time budgets.
//!
//! A [`Budget`] carries an optional deadline and a cancellation flag. Child
//! budgets inherit their ancestors' deadlines and cancellation, never the
//! other way around. Budgets are checked at call boundaries ([`Budget::check`])
//! or raced against a future ([`Budget::run`]); nothing polls them in a loop.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DeadlineExceeded,
    Cancelled,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            CancelReason::DeadlineExceeded => "deadline exceeded",
            CancelReason::Cancelled => "cancelled",
        };

        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BudgetEntry {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Time since the budget that recorded the entry was created.
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Error)]
#[error("budget `{budget}` exhausted ({reason}) after {elapsed_ms}ms, last entry: {last_entry}")]
pub struct BudgetExceeded {
    /// Name of the budget the cancellation originated from.
    pub budget: String,
    pub reason: CancelReason,
    pub elapsed_ms: u128,
    pub last_entry: String,
}

pub type EntryObserver = Arc<dyn Fn(&BudgetEntry, &Budget) + Send + Sync>;

struct BudgetInner {
    name: String,
    started: Instant,
    deadline: Option<Instant>,
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
    entries: Mutex<Vec<BudgetEntry>>,
    observers: Mutex<Vec<EntryObserver>>,
    parent: Option<Weak<BudgetInner>>,
}

#[derive(Clone)]
pub struct Budget {
    inner: Arc<BudgetInner>,
}

impl Budget {
    pub fn new(name: impl Into<String>, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            inner: Arc::new(BudgetInner {
                name: name.into(),
                started,
                deadline: timeout.map(|t| started + t),
                token: CancellationToken::new(),
                reason: OnceLock::new(),
                entries: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                parent: None,
            }),
        }
    }

    pub fn unbounded(name: impl Into<String>) -> Self {
        Self::new(name, None)
    }

    /// Creates a child whose effective deadline is the earlier of `timeout`
    /// and every ancestor's deadline.
    pub fn child(&self, name: impl Into<String>, timeout: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            inner: Arc::new(BudgetInner {
                name: name.into(),
                started,
                deadline: timeout.map(|t| started + t),
                token: self.inner.token.child_token(),
                reason: OnceLock::new(),
                entries: Mutex::new(Vec::new()),
                observers: Mutex::new(Vec::new()),
                parent: Some(Arc::downgrade(&self.inner)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<Budget> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Budget { inner })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    pub fn effective_deadline(&self) -> Option<Instant> {
        let own = self.inner.deadline;
        match self.parent().and_then(|parent| parent.effective_deadline()) {
            Some(inherited) => Some(own.map_or(inherited, |d| d.min(inherited))),
            None => own,
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.effective_deadline()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn elapsed(&self) -> Duration {
        self.inner.started.elapsed()
    }

    /// Appends a named entry and notifies observers registered on this budget
    /// and on each of its ancestors.
    pub fn record_entry(&self, name: impl Into<String>) {
        let entry = BudgetEntry {
            name: name.into(),
            timestamp: Utc::now(),
            elapsed: self.elapsed(),
        };

        tracing::trace!(budget = %self.name(), entry = %entry.name, "budget.entry");

        self.inner
            .entries
            .lock()
            .unwrap()
            .push(entry.clone());

        let mut current = Some(self.clone());
        while let Some(budget) = current {
            let observers = budget.inner.observers.lock().unwrap().clone();
            for observer in observers {
                observer(&entry, &budget);
            }
            current = budget.parent();
        }
    }

    pub fn on_entry<F>(&self, observer: F)
    where
        F: Fn(&BudgetEntry, &Budget) + Send + Sync + 'static,
    {
        self.inner.observers.lock().unwrap().push(Arc::new(observer));
    }

    pub fn entries(&self) -> Vec<BudgetEntry> {
        self.inner.entries.lock().unwrap().clone()
    }

    pub fn last_entry(&self) -> Option<BudgetEntry> {
        self.inner.entries.lock().unwrap().last().cloned()
    }

    pub fn cancel(&self) {
        self.cancel_with(CancelReason::Cancelled);
    }

    fn cancel_with(&self, reason: CancelReason) {
        if !self.inner.token.is_cancelled() {
            let _ = self.inner.reason.set(reason);
            tracing::debug!(budget = %self.name(), %reason, "budget cancelled");
        }
        self.inner.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Returns true once the budget, or any ancestor, has been cancelled or
    /// run past its deadline. Passing a deadline cancels the budget that owns
    /// it, so the expiry reaches every descendant.
    pub fn is_exceeded(&self) -> bool {
        if self.is_cancelled() {
            return true;
        }
        self.expire_due(Instant::now())
    }

    fn expire_due(&self, now: Instant) -> bool {
        let mut expired = false;
        let mut current = Some(self.clone());
        while let Some(budget) = current {
            if budget.inner.deadline.is_some_and(|deadline| deadline <= now) {
                budget.cancel_with(CancelReason::DeadlineExceeded);
                expired = true;
            }
            current = budget.parent();
        }
        expired
    }

    pub fn check(&self) -> Result<(), BudgetExceeded> {
        if self.is_exceeded() {
            Err(self.exceeded())
        } else {
            Ok(())
        }
    }

    /// Describes why this budget is exhausted, attributing the cancellation to
    /// the nearest budget in the ancestry that recorded a reason.
    pub fn exceeded(&self) -> BudgetExceeded {
        let mut origin = None;
        let mut current = Some(self.clone());
        while let Some(budget) = current {
            if let Some(reason) = budget.inner.reason.get() {
                origin = Some((budget.name().to_string(), *reason));
                break;
            }
            current = budget.parent();
        }

        let (budget, reason) =
            origin.unwrap_or_else(|| (self.name().to_string(), CancelReason::Cancelled));

        BudgetExceeded {
            budget,
            reason,
            elapsed_ms: self.elapsed().as_millis(),
            last_entry: self
                .last_entry()
                .map(|entry| entry.name)
                .unwrap_or_else(|| "<none>".to_string()),
        }
    }

    /// Resolves once the budget is cancelled or its effective deadline passes.
    pub async fn exhausted(&self) {
        let deadline = self.effective_deadline();

        tokio::select! {
            _ = self.inner.token.cancelled() => {}
            _ = sleep_until(deadline) => {
                self.expire_due(Instant::now());
            }
        }
    }

    /// Drives `fut` to completion unless the budget is exhausted first, in
    /// which case `fut` is dropped.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, BudgetExceeded>
    where
        F: Future,
    {
        self.check()?;

        tokio::select! {
            biased;
            _ = self.exhausted() => Err(self.exceeded()),
            output = fut => Ok(output),
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

impl fmt::Debug for Budget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Budget")
            .field("name", &self.inner.name)
            .field("deadline", &self.inner.deadline)
            .field("cancelled", &self.is_cancelled())
            .field("entries", &self.inner.entries.lock().unwrap().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_unbounded_budget_is_not_exceeded() {
        let budget = Budget::unbounded("request");
        assert!(!budget.is_exceeded());
        assert!(budget.check().is_ok());
        assert!(budget.remaining().is_none());
    }

    #[test]
    fn test_cancel_is_permanent() {
        let budget = Budget::unbounded("request");
        budget.cancel();

        assert!(budget.is_exceeded());
        assert!(budget.is_exceeded());

        let exceeded = budget.check().unwrap_err();
        assert_eq!(exceeded.reason, CancelReason::Cancelled);
        assert_eq!(exceeded.budget, "request");
    }

    #[tokio::test]
    async fn test_deadline_expiry() {
        let budget = Budget::new("request", Some(Duration::from_millis(10)));
        tokio::time::sleep(Duration::from_millis(30)).await;

        let exceeded = budget.check().unwrap_err();
        assert_eq!(exceeded.reason, CancelReason::DeadlineExceeded);
        assert!(budget.is_cancelled());
    }

    #[test]
    fn test_child_deadline_never_outlives_parent() {
        let parent = Budget::new("request", Some(Duration::from_millis(50)));
        let child = parent.child("execute", Some(Duration::from_secs(60)));

        assert_eq!(child.effective_deadline(), parent.deadline());

        let unbounded_child = parent.child("build", None);
        assert_eq!(unbounded_child.effective_deadline(), parent.deadline());

        let tight = parent.child("analyze", Some(Duration::from_millis(1)));
        assert_eq!(tight.effective_deadline(), tight.deadline());
    }

    #[test]
    fn test_parent_cancellation_reaches_descendants() {
        let root = Budget::unbounded("request");
        let child = root.child("build", None);
        let grandchild = child.child("compile", None);

        root.cancel();

        assert!(child.is_exceeded());
        assert!(grandchild.is_exceeded());
        let exceeded = grandchild.exceeded();
        assert_eq!(exceeded.budget, "request");
        assert_eq!(exceeded.reason, CancelReason::Cancelled);
    }

    #[test]
    fn test_child_cancellation_stays_local() {
        let root = Budget::unbounded("request");
        let build = root.child("build", None);
        let execute = root.child("execute", None);

        execute.cancel();

        assert!(execute.is_exceeded());
        assert!(!build.is_exceeded());
        assert!(!root.is_exceeded());
    }

    #[tokio::test]
    async fn test_parent_deadline_cancels_siblings() {
        let root = Budget::new("request", Some(Duration::from_millis(10)));
        let build = root.child("build", None);
        let execute = root.child("execute", None);

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(build.is_exceeded());
        assert!(execute.is_cancelled());
        assert_eq!(execute.exceeded().budget, "request");
        assert_eq!(execute.exceeded().reason, CancelReason::DeadlineExceeded);
    }

    #[test]
    fn test_entries_are_appended_in_order() {
        let budget = Budget::unbounded("request");
        budget.record_entry("validate");
        budget.record_entry("build");

        let names: Vec<String> = budget.entries().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["validate", "build"]);
        assert_eq!(budget.last_entry().unwrap().name, "build");
    }

    #[test]
    fn test_observer_cancels_on_named_entry() {
        let root = Budget::unbounded("request");
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        root.on_entry(move |entry, budget| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
            if entry.name == "compile" {
                budget.cancel();
            }
        });

        let build = root.child("build", None);
        build.record_entry("analyze");
        assert!(!build.is_exceeded());

        build.record_entry("compile");
        assert!(root.is_exceeded());
        assert!(build.is_exceeded());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let exceeded = build.exceeded();
        assert_eq!(exceeded.budget, "request");
        assert_eq!(exceeded.last_entry, "compile");
    }

    #[tokio::test]
    async fn test_run_completes_within_budget() {
        let budget = Budget::new("request", Some(Duration::from_secs(5)));
        let value = budget.run(async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_is_interrupted_by_cancel() {
        let budget = Budget::unbounded("request");
        let canceller = budget.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = budget
            .run(tokio::time::sleep(Duration::from_secs(30)))
            .await;
        assert_eq!(result.unwrap_err().reason, CancelReason::Cancelled);
    }

    #[tokio::test]
    async fn test_run_is_interrupted_by_deadline() {
        let budget = Budget::new("execute", Some(Duration::from_millis(20)));
        let result = budget
            .run(tokio::time::sleep(Duration::from_secs(30)))
            .await;

        let exceeded = result.unwrap_err();
        assert_eq!(exceeded.reason, CancelReason::DeadlineExceeded);
        assert_eq!(exceeded.budget, "execute");
    }

    #[tokio::test]
    async fn test_run_fails_fast_when_already_exceeded() {
        let budget = Budget::unbounded("request");
        budget.cancel();

        let polled = Arc::new(AtomicUsize::new(0));
        let polled_clone = polled.clone();
        let result = budget
            .run(async move {
                polled_clone.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(result.is_err());
        assert_eq!(polled.load(Ordering::SeqCst), 0);
    }
}
