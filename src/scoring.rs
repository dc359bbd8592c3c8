use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::settings::Settings;
use crate::suite::{guarded, Scope, Suite, TestSet, Verdict};

/// One row of a scored test set.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CaseRow {
    pub index: usize,
    pub score: f64,
    pub message: Option<String>,
    pub description: Option<String>,
    /// One value per case penalty. Empty for cases scoring zero.
    pub penalties: Vec<f64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PenaltyTotal {
    pub name: String,
    pub total: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetReport {
    pub num_tests: usize,
    pub rows: Vec<CaseRow>,
    /// Sum of the case scores divided by the number of tests.
    pub score: f64,
    pub case_penalties: Vec<PenaltyTotal>,
    pub set_penalties: Vec<PenaltyTotal>,
    /// Errors and panics caught while running plugin code.
    pub diagnostics: Vec<String>,
}

impl SetReport {
    pub fn total_penalty(&self) -> f64 {
        self.case_penalties
            .iter()
            .chain(self.set_penalties.iter())
            .map(|p| p.total)
            .sum()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum TestSetOutcome {
    Scored(SetReport),
    BuildFailed(String),
    RuntimeFailed(String),
}

/// A test set outcome together with its final score.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SetResult {
    pub name: String,
    pub id: String,
    pub max_score: f64,
    pub score: f64,
    pub outcome: TestSetOutcome,
}

/// `(raw - min(max_penalty, total_penalty)) * max_score`
///
/// Penalties only ever deduct: a negative total counts as no penalty.
pub fn final_score(raw: f64, total_penalty: f64, max_penalty: f64, max_score: f64) -> f64 {
    (raw - max_penalty.min(total_penalty.max(0.0))) * max_score
}

/// Penalty function results below zero count as zero.
fn penalty_value(value: f64) -> f64 {
    if value.is_finite() {
        value.max(0.0)
    } else {
        0.0
    }
}

/// What a test set runs against for one submission.
pub struct Environment<'a, S: Suite> {
    pub suite: &'a S,
    pub subject: Option<&'a S::Subject>,
    pub framework: &'a S::Framework,
    pub settings: &'a Settings,
    pub artifacts: Option<&'a Path>,
    /// Set when building the submission failed.
    pub build_failure: Option<String>,
}

impl<'a, S: Suite> Environment<'a, S> {
    fn failure(&self, reason: String) -> TestSetOutcome {
        match &self.build_failure {
            Some(_) => TestSetOutcome::BuildFailed(reason),
            None => TestSetOutcome::RuntimeFailed(reason),
        }
    }
}

/// Runs every case of `set` and computes the raw score and penalty totals.
pub fn run_test_set<S: Suite>(set: &TestSet<S>, env: &Environment<S>) -> TestSetOutcome {
    let Some(subject) = env.subject else {
        return env.failure(match &env.build_failure {
            Some(reason) => format!("build failed: {reason}"),
            None => "subject could not be initialized".to_string(),
        });
    };

    let context = match guarded(|| {
        env.suite
            .initialize_test_set(set, subject, env.framework, env.settings)
    }) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Error initializing test set {}: {e}", set.name);
            return TestSetOutcome::RuntimeFailed(format!("initialize_test_set() failed: {e}"));
        }
    };

    let scope = Scope {
        context: &context,
        subject,
        framework: env.framework,
        settings: env.settings,
        artifacts: env.artifacts,
    };
    let outcome = score_cases(set, &scope, env);

    if let Err(e) = guarded(|| {
        env.suite.shutdown_test_set(context);
        Ok(())
    }) {
        log::error!("Error shutting down test set {}: {e}", set.name);
    }
    outcome
}

fn score_cases<S: Suite>(set: &TestSet<S>, scope: &Scope<S>, env: &Environment<S>) -> TestSetOutcome {
    let num_tests = match guarded(|| set.count.evaluate(scope)) {
        Ok(0) => return env.failure("test count returned [0]".to_string()),
        Ok(n) => n,
        Err(e) => return env.failure(format!("test count failed: {e}")),
    };
    let n = num_tests as f64;

    let mut diagnostics = vec![];
    let mut rows = Vec::with_capacity(num_tests);
    let mut case_totals = vec![0.0; set.case_penalties.len()];
    let mut score = 0.0;

    for index in 0..num_tests {
        let (case_score, message) = match guarded(|| (set.runner)(index, scope)) {
            Ok(Verdict::Score(s)) if s.is_finite() => (s, None),
            Ok(Verdict::Score(s)) => (0.0, Some(format!("invalid score {s}"))),
            Ok(Verdict::Message(m)) => (0.0, Some(m)),
            Err(e) => {
                log::error!("Test {index} of {} failed: {e}", set.name);
                diagnostics.push(format!("test {index}: {e}"));
                (0.0, Some(e))
            }
        };
        score += case_score;

        let description = if (case_score * 1e10).round() / 1e10 < 1.0 {
            Some(set.describe(index, scope))
        } else {
            None
        };

        let mut penalties = vec![];
        if case_score != 0.0 {
            for (pi, penalty) in set.case_penalties.iter().enumerate() {
                let value = guarded(|| (penalty.function)(pi, index, scope)).unwrap_or_else(|e| {
                    log::error!("{} penalty of test {index} failed: {e}", penalty.name);
                    diagnostics.push(format!("{} penalty, test {index}: {e}", penalty.name));
                    0.0
                });
                let value = penalty_value(value);
                case_totals[pi] += value * penalty.magnitude * case_score / n;
                penalties.push(value);
            }
        }

        rows.push(CaseRow {
            index,
            score: case_score,
            message,
            description,
            penalties,
        });
    }

    let raw = score / n;
    let set_penalties: Vec<PenaltyTotal> = set
        .set_penalties
        .iter()
        .enumerate()
        .map(|(pi, penalty)| {
            let value = guarded(|| (penalty.function)(pi, scope)).unwrap_or_else(|e| {
                log::error!("{} penalty of {} failed: {e}", penalty.name, set.name);
                diagnostics.push(format!("{} penalty: {e}", penalty.name));
                0.0
            });
            PenaltyTotal {
                name: penalty.name.clone(),
                total: penalty_value(value) * score * penalty.magnitude,
            }
        })
        .collect();

    TestSetOutcome::Scored(SetReport {
        num_tests,
        rows,
        score: raw,
        case_penalties: set
            .case_penalties
            .iter()
            .zip(case_totals)
            .map(|(p, total)| PenaltyTotal {
                name: p.name.clone(),
                total,
            })
            .collect(),
        set_penalties,
        diagnostics,
    })
}

/// Runs a test set and applies the penalty clamp and the set's max score.
pub fn grade_test_set<S: Suite>(set: &TestSet<S>, env: &Environment<S>) -> SetResult {
    let outcome = run_test_set(set, env);
    let score = match &outcome {
        TestSetOutcome::Scored(report) => final_score(
            report.score,
            report.total_penalty(),
            set.max_penalty,
            set.max_score,
        ),
        TestSetOutcome::BuildFailed(reason) | TestSetOutcome::RuntimeFailed(reason) => {
            log::error!("Error: {reason}");
            0.0
        }
    };
    SetResult {
        name: set.name.clone(),
        id: set.id.clone(),
        max_score: set.max_score,
        score,
        outcome,
    }
}
