//! The contract between the grader and the code that knows how to test a
//! particular assignment.
//!
//! A [`Suite`] owns a list of [`TestSet`]s and the lifecycle hooks of the three
//! contexts it defines: one framework context per run, one subject context per
//! submission and one set context per test set and submission.

use serde::{de::DeserializeOwned, Serialize};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    path::Path,
};

use crate::error::Error;
use crate::settings::Settings;

pub trait Suite: Sized + Sync {
    /// Shared by every submission of a run. Worker processes receive it
    /// serialized from the coordinator.
    type Framework: Sync + Serialize + DeserializeOwned;
    /// State for one submission.
    type Subject;
    /// State for one test set of one submission.
    type SetContext;

    fn test_sets(&self) -> &[TestSet<Self>];

    /// Called once per run, after the framework has been built. Worker
    /// processes never call it.
    fn initialize_framework(&self, settings: &Settings) -> Result<Self::Framework, Error>;

    fn shutdown_framework(&self, _framework: Self::Framework) {}

    /// Called after the submission has been built. `settings` points at the
    /// submission's working tree.
    fn initialize_subject(
        &self,
        submission: &Path,
        framework: &Self::Framework,
        settings: &Settings,
    ) -> Result<Self::Subject, Error>;

    fn shutdown_subject(&self, _subject: Self::Subject) {}

    fn initialize_test_set(
        &self,
        set: &TestSet<Self>,
        subject: &Self::Subject,
        framework: &Self::Framework,
        settings: &Settings,
    ) -> Result<Self::SetContext, Error>;

    fn shutdown_test_set(&self, _context: Self::SetContext) {}
}

/// Everything a test function can look at.
pub struct Scope<'a, S: Suite> {
    pub context: &'a S::SetContext,
    pub subject: &'a S::Subject,
    pub framework: &'a S::Framework,
    pub settings: &'a Settings,
    /// Result files fetched from a remote machine, when one is used.
    pub artifacts: Option<&'a Path>,
}

/// Outcome of a single test case.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Fraction of the case passed, normally in `[0, 1]`.
    Score(f64),
    /// The case failed with a message. Scores 0.
    Message(String),
}

impl From<f64> for Verdict {
    fn from(score: f64) -> Self {
        Verdict::Score(score)
    }
}

impl From<bool> for Verdict {
    fn from(passed: bool) -> Self {
        Verdict::Score(if passed { 1.0 } else { 0.0 })
    }
}

pub type CountFn<S> = Box<dyn Fn(&Scope<S>) -> Result<usize, Error> + Send + Sync>;
pub type CaseFn<S> = Box<dyn Fn(usize, &Scope<S>) -> Result<Verdict, Error> + Send + Sync>;
pub type DescriptionFn<S> = Box<dyn Fn(usize, &Scope<S>) -> String + Send + Sync>;
/// Called with the penalty index, the test index and the scope.
pub type CasePenaltyFn<S> =
    Box<dyn Fn(usize, usize, &Scope<S>) -> Result<f64, Error> + Send + Sync>;
/// Called with the penalty index and the scope.
pub type SetPenaltyFn<S> = Box<dyn Fn(usize, &Scope<S>) -> Result<f64, Error> + Send + Sync>;

pub enum TestCount<S: Suite> {
    Fixed(usize),
    Computed(CountFn<S>),
}

impl<S: Suite> TestCount<S> {
    pub fn evaluate(&self, scope: &Scope<S>) -> Result<usize, Error> {
        match self {
            TestCount::Fixed(n) => Ok(*n),
            TestCount::Computed(f) => f(scope),
        }
    }
}

pub struct Penalty<F> {
    pub name: String,
    pub magnitude: f64,
    pub function: F,
}

pub struct TestSet<S: Suite> {
    pub name: String,
    pub id: String,
    pub count: TestCount<S>,
    pub runner: CaseFn<S>,
    pub description: Option<DescriptionFn<S>>,
    pub max_score: f64,
    pub max_penalty: f64,
    pub case_penalties: Vec<Penalty<CasePenaltyFn<S>>>,
    pub set_penalties: Vec<Penalty<SetPenaltyFn<S>>>,
}

impl<S: Suite> std::fmt::Debug for TestSet<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSet")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("max_score", &self.max_score)
            .field("max_penalty", &self.max_penalty)
            .field(
                "case_penalties",
                &self.case_penalties.iter().map(|p| &p.name).collect::<Vec<_>>(),
            )
            .field(
                "set_penalties",
                &self.set_penalties.iter().map(|p| &p.name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<S: Suite> TestSet<S> {
    pub fn builder<F>(name: &str, id: &str, count: TestCount<S>, runner: F) -> TestSetBuilder<S>
    where
        F: Fn(usize, &Scope<S>) -> Result<Verdict, Error> + Send + Sync + 'static,
    {
        TestSetBuilder {
            set: TestSet {
                name: name.to_string(),
                id: id.to_string(),
                count,
                runner: Box::new(runner),
                description: None,
                max_score: 100.0,
                max_penalty: 0.0,
                case_penalties: vec![],
                set_penalties: vec![],
            },
        }
    }

    /// Description of a failed case, `Test #<n>` unless the set provides one.
    pub fn describe(&self, index: usize, scope: &Scope<S>) -> String {
        let default = || format!("Test #{index}");
        match &self.description {
            Some(f) => guarded(|| Ok(f(index, scope))).unwrap_or_else(|e| {
                log::warn!("Description of test {index} in {} failed: {e}", self.name);
                default()
            }),
            None => default(),
        }
    }
}

pub struct TestSetBuilder<S: Suite> {
    set: TestSet<S>,
}

impl<S: Suite> TestSetBuilder<S> {
    pub fn max_score(mut self, max_score: f64) -> Self {
        self.set.max_score = max_score;
        self
    }

    /// Upper bound of the total penalty, as a fraction of the raw score.
    pub fn max_penalty(mut self, max_penalty: f64) -> Self {
        self.set.max_penalty = max_penalty;
        self
    }

    pub fn description<F>(mut self, f: F) -> Self
    where
        F: Fn(usize, &Scope<S>) -> String + Send + Sync + 'static,
    {
        self.set.description = Some(Box::new(f));
        self
    }

    pub fn case_penalty<F>(mut self, name: &str, magnitude: f64, f: F) -> Self
    where
        F: Fn(usize, usize, &Scope<S>) -> Result<f64, Error> + Send + Sync + 'static,
    {
        self.set.case_penalties.push(Penalty {
            name: name.to_string(),
            magnitude,
            function: Box::new(f),
        });
        self
    }

    pub fn set_penalty<F>(mut self, name: &str, magnitude: f64, f: F) -> Self
    where
        F: Fn(usize, &Scope<S>) -> Result<f64, Error> + Send + Sync + 'static,
    {
        self.set.set_penalties.push(Penalty {
            name: name.to_string(),
            magnitude,
            function: Box::new(f),
        });
        self
    }

    /// Validates the set. Invalid sets are configuration errors.
    pub fn build(mut self) -> Result<TestSet<S>, Error> {
        let set = &mut self.set;
        if set.name.trim().is_empty() {
            return Error::config("Test set name must not be empty");
        }
        if !set.max_score.is_finite() || set.max_score < 0.0 {
            return Error::config(format!(
                "Test set {}: max score must be a non-negative number, got {}",
                set.name, set.max_score
            ));
        }
        if !(0.0..=1.0).contains(&set.max_penalty) {
            return Error::config(format!(
                "Test set {}: max penalty must be within [0, 1], got {}",
                set.name, set.max_penalty
            ));
        }

        let names = set
            .case_penalties
            .iter()
            .map(|p| (&p.name, p.magnitude))
            .chain(set.set_penalties.iter().map(|p| (&p.name, p.magnitude)));
        for (name, magnitude) in names {
            if name.trim().is_empty() {
                return Error::config(format!("Test set {}: unnamed penalty", set.name));
            }
            if !magnitude.is_finite() || magnitude < 0.0 {
                return Error::config(format!(
                    "Test set {}: penalty {name} has invalid magnitude {magnitude}",
                    set.name
                ));
            }
        }

        set.case_penalties.retain(|p| p.magnitude != 0.0);
        set.set_penalties.retain(|p| p.magnitude != 0.0);
        Ok(self.set)
    }
}

/// Runs plugin code, turning both errors and panics into a message.
pub fn guarded<T, F: FnOnce() -> Result<T, Error>>(f: F) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
