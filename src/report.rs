use std::{io::Write, path::Path};

use crate::error::Error;
use crate::scoring::{CaseRow, SetResult, TestSetOutcome};
use crate::submission::{Submission, SubmissionOutcome};

pub const SUMMARY_HEADER: [&str; 3] = ["Student", "LMS ID", "Score"];

fn pct(v: f64) -> String {
    format!("{:.2}%", v * 100.0)
}

fn case_row(row: &CaseRow) -> Vec<String> {
    let mut out = vec![
        row.index.to_string(),
        pct(row.score),
        row.message.clone().unwrap_or_default(),
        row.description.clone().unwrap_or_default(),
    ];
    out.extend(row.penalties.iter().map(|p| pct(*p)));
    out
}

/// Rows describing one test set, ending with its final score.
pub fn set_rows(result: &SetResult) -> Vec<Vec<String>> {
    let mut rows = vec![vec![format!("Test Set {}", result.name)]];
    match &result.outcome {
        TestSetOutcome::Scored(report) => {
            rows.push(vec![format!("Number of tests: {}.", report.num_tests)]);
            rows.push(vec![]);

            let mut header: Vec<String> = ["Test No.", "Score", "Message", "Desc."]
                .iter()
                .map(|s| s.to_string())
                .collect();
            header.extend(report.case_penalties.iter().map(|p| format!("{}-Pen", p.name)));
            rows.push(header);
            rows.extend(report.rows.iter().map(case_row));

            rows.push(vec![]);
            rows.push(vec![format!(
                "Test Cases: {:.2} ({:.2}%)",
                report.score * result.max_score,
                report.score * 100.0
            )]);
            for p in report.case_penalties.iter().chain(report.set_penalties.iter()) {
                rows.push(vec![format!("{} Penalty (overall): {}", p.name, pct(p.total))]);
            }
        }
        TestSetOutcome::BuildFailed(_) | TestSetOutcome::RuntimeFailed(_) => {
            rows.push(vec![]);
            rows.push(vec!["Grade: 0 (Does not compile / run)".to_string()]);
        }
    }
    rows.push(vec![format!("{}: {:.3}", result.name, result.score)]);
    rows
}

/// All rows of a submission's result file.
pub fn result_rows(submission: &Submission, outcome: &SubmissionOutcome) -> Vec<Vec<String>> {
    let mut rows = vec![vec![format!(
        "Scores for {} (LMS ID: {})...",
        submission.student, submission.lms_id
    )]];
    if let Some(reason) = &outcome.failure {
        rows.push(vec![format!("Grading failed: {reason}")]);
    }
    for set in outcome.sets.iter() {
        rows.extend(set_rows(set));
    }
    rows.push(vec![format!("Overall score: {:.2}", outcome.total())]);
    rows
}

fn writer_builder() -> csv::WriterBuilder {
    let mut b = csv::WriterBuilder::new();
    b.flexible(true).has_headers(false);
    b
}

/// Empty rows become bare line breaks instead of a quoted empty field.
fn write_rows<W: Write>(w: &mut csv::Writer<W>, rows: &[Vec<String>]) -> Result<(), Error> {
    for row in rows {
        if row.is_empty() {
            w.flush()?;
            w.get_mut().write_all(b"\n")?;
        } else {
            w.write_record(row)?;
        }
    }
    w.flush()?;
    Ok(())
}

/// Writes the result file of one submission, replacing any previous one.
pub fn write_result<P: AsRef<Path>>(
    path: P,
    submission: &Submission,
    outcome: &SubmissionOutcome,
) -> Result<(), Error> {
    let mut w = writer_builder().from_path(path.as_ref())?;
    write_rows(&mut w, &result_rows(submission, outcome))
}

/// Starts a new summary file containing only the header.
pub fn init_summary<P: AsRef<Path>>(path: P) -> Result<(), Error> {
    let mut w = writer_builder().from_path(path.as_ref())?;
    w.write_record(SUMMARY_HEADER)?;
    w.flush()?;
    Ok(())
}

/// Appends the row of one graded submission to the summary file.
pub fn append_summary<P: AsRef<Path>>(
    path: P,
    submission: &Submission,
    outcome: &SubmissionOutcome,
) -> Result<(), Error> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path.as_ref())?;
    let mut w = writer_builder().from_writer(file);
    w.write_record([
        submission.student.clone(),
        submission.lms_id.clone(),
        format!("{:.2}", outcome.total()),
    ])?;
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::{PenaltyTotal, SetReport};
    use asserting::prelude::*;

    fn scored() -> SetResult {
        SetResult {
            name: "Basics".to_string(),
            id: "basics".to_string(),
            max_score: 10.0,
            score: 4.7,
            outcome: TestSetOutcome::Scored(SetReport {
                num_tests: 3,
                rows: vec![
                    CaseRow {
                        index: 0,
                        score: 1.0,
                        message: None,
                        description: None,
                        penalties: vec![0.2],
                    },
                    CaseRow {
                        index: 1,
                        score: 0.5,
                        message: None,
                        description: Some("Test #1".to_string()),
                        penalties: vec![0.2],
                    },
                    CaseRow {
                        index: 2,
                        score: 0.0,
                        message: Some("wrong output".to_string()),
                        description: Some("Test #2".to_string()),
                        penalties: vec![],
                    },
                ],
                score: 0.5,
                case_penalties: vec![PenaltyTotal {
                    name: "Leaks".to_string(),
                    total: 0.03,
                }],
                set_penalties: vec![],
                diagnostics: vec![],
            }),
        }
    }

    fn submission() -> Submission {
        Submission::new("/tmp/Projects/alice_12345").unwrap()
    }

    #[test]
    fn test_scored_rows() {
        let rows = set_rows(&scored());
        assert_that!(rows[0].clone()).is_equal_to(vec!["Test Set Basics".to_string()]);
        assert_that!(rows[1].clone()).is_equal_to(vec!["Number of tests: 3.".to_string()]);
        assert_that!(rows[3].clone()).is_equal_to(
            ["Test No.", "Score", "Message", "Desc.", "Leaks-Pen"]
                .map(String::from)
                .to_vec(),
        );
        assert_that!(rows[5].clone()).is_equal_to(
            ["1", "50.00%", "", "Test #1", "20.00%"]
                .map(String::from)
                .to_vec(),
        );
        assert_that!(rows[6].len()).is_equal_to(4);
        let text: Vec<String> = rows.iter().skip(7).map(|r| r.join(",")).collect();
        assert_that!(text).is_equal_to(vec![
            "".to_string(),
            "Test Cases: 5.00 (50.00%)".to_string(),
            "Leaks Penalty (overall): 3.00%".to_string(),
            "Basics: 4.700".to_string(),
        ]);
    }

    #[test]
    fn test_failed_rows() {
        let mut result = scored();
        result.score = 0.0;
        result.outcome = TestSetOutcome::BuildFailed("exit code 2".to_string());
        let rows = set_rows(&result);
        assert_that!(rows.len()).is_equal_to(4);
        assert_that!(rows[2].clone())
            .is_equal_to(vec!["Grade: 0 (Does not compile / run)".to_string()]);
    }

    #[test]
    fn test_write_result_file() {
        let d = tempfile::tempdir().unwrap();
        let path = d.path().join("result.csv");
        let outcome = SubmissionOutcome {
            sets: vec![scored()],
            ..Default::default()
        };
        write_result(&path, &submission(), &outcome).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_that!(contents.as_str()).starts_with("Scores for alice (LMS ID: 12345)...\n");
        assert_that!(contents.as_str()).ends_with("Overall score: 4.70\n");
        assert_that!(contents.as_str()).contains("Number of tests: 3.\n\nTest No.,");
        assert_that!(contents.as_str()).does_not_contain("\"\"");
    }

    #[test]
    fn test_summary_header_and_rows() {
        let d = tempfile::tempdir().unwrap();
        let path = d.path().join("summary.csv");
        init_summary(&path).unwrap();
        let outcome = SubmissionOutcome {
            sets: vec![scored()],
            ..Default::default()
        };
        append_summary(&path, &submission(), &outcome).unwrap();
        append_summary(
            &path,
            &Submission::new("/tmp/Projects/bob").unwrap(),
            &SubmissionOutcome::failed("unreachable"),
        )
        .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_that!(contents)
            .is_equal_to("Student,LMS ID,Score\nalice,12345,4.70\nbob,NONE,0.00\n".to_string());
    }
}
