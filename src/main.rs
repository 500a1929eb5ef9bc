use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod analytics;
mod api;
mod attainment;
mod config;
mod export;
mod import;
mod models;
mod outcomes;
mod report;
mod targets;
mod trends;

use crate::analytics::{
    format_average, history, student_average, three_year_comparison, StudentFilter,
};
use crate::api::{ApiClient, ApiError, Credentials, Session};
use crate::attainment::Category;
use crate::config::{ApiConfig, AttainmentParameters};
use crate::export::ExportFormat;
use crate::models::{
    CoId, CoSummary, CourseOutcomeTarget, NewStudent, PoSummary, Student, StudentUpdate,
};
use crate::trends::TrendAxis;

#[derive(Parser)]
#[command(name = "copo-attainment")]
#[command(about = "Course and program outcome attainment tracker", long_about = None)]
struct Cli {
    /// Raise log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// JSON file overriding the attainment parameters
    #[arg(long, global = true)]
    params: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and print a session token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account and print a session token
    Signup {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// List students with their averages and CO attainment
    List {
        #[arg(long)]
        student_id: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        department: Option<String>,
    },
    /// Show one student's history, CO and PO attainment
    Summary {
        student_id: String,
        /// Use the server's calculation instead of computing locally
        #[arg(long)]
        remote: bool,
        /// CO to PO correlation matrix (CSV)
        #[arg(long)]
        po_matrix: Option<PathBuf>,
    },
    /// Import students from a spreadsheet export
    Import {
        #[arg(long)]
        csv: PathBuf,
        /// Parse and validate without uploading
        #[arg(long)]
        dry_run: bool,
    },
    /// Export every student's performance, grouped by department
    Export {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
        #[arg(long)]
        remote: bool,
    },
    /// Raise CO targets the student comfortably exceeded
    AdjustTargets {
        student_id: String,
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete a student record
    Delete { student_id: String },
    /// Compute CO attainment from per-category worksheets
    #[command(group(
        ArgGroup::new("sheets")
            .args(["internal", "assignment", "class_test", "seminar", "work_project", "semester"])
            .required(true)
            .multiple(true)
    ))]
    Semester {
        #[arg(long)]
        internal: Option<PathBuf>,
        #[arg(long)]
        assignment: Option<PathBuf>,
        #[arg(long)]
        class_test: Option<PathBuf>,
        #[arg(long)]
        seminar: Option<PathBuf>,
        #[arg(long)]
        work_project: Option<PathBuf>,
        /// Semester end exam worksheet
        #[arg(long)]
        semester: Option<PathBuf>,
        /// Course exit survey (co, attainment)
        #[arg(long)]
        survey: Option<PathBuf>,
        /// CO target, e.g. `CO1=75`; repeatable
        #[arg(long = "target", value_parser = parse_target)]
        targets: Vec<CourseOutcomeTarget>,
        #[arg(long)]
        po_matrix: Option<PathBuf>,
        #[arg(long)]
        course: Option<String>,
        /// Write the markdown report here as well
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Mean marks per year, department or course with a next-period projection
    Trends {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, value_enum, default_value_t = TrendAxis::Year)]
        by: TrendAxis,
    },
    /// Print the effective attainment parameters
    Params,
}

fn parse_target(raw: &str) -> Result<CourseOutcomeTarget, String> {
    let (co, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected CO=TARGET, got `{raw}`"))?;
    let co_id = CoId::new(co);
    if co_id.is_empty() {
        return Err(format!("missing CO in `{raw}`"));
    }
    let target = models::parse_number(value)
        .filter(|target| (0.0..=100.0).contains(target))
        .ok_or_else(|| format!("target in `{raw}` must be a number between 0 and 100"))?;
    Ok(CourseOutcomeTarget { co_id, target })
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Err(err) if matches!(err.downcast_ref::<ApiError>(), Some(ApiError::SessionExpired)) => {
            eprintln!("Session expired. Run `copo-attainment login` and set COPO_API_TOKEN again.");
            std::process::exit(2);
        }
        other => other,
    }
}

fn connect(config: &ApiConfig) -> anyhow::Result<(ApiClient, Session)> {
    let token = config.require_token()?;
    let client = ApiClient::new(config).context("failed to build HTTP client")?;
    Ok((client, Session::new(token)))
}

async fn find_student(
    client: &ApiClient,
    session: &Session,
    student_id: &str,
) -> anyhow::Result<Student> {
    let students = client.list_students(session).await?;
    students
        .into_iter()
        .find(|student| student.student_id == student_id)
        .with_context(|| format!("no student with id {student_id}"))
}

fn local_summaries(
    students: &[Student],
    params: &AttainmentParameters,
) -> BTreeMap<String, BTreeMap<CoId, CoSummary>> {
    students
        .iter()
        .map(|student| {
            (
                student.student_id.clone(),
                attainment::aggregate(&student.marks, &student.course_outcomes, params),
            )
        })
        .collect()
}

async fn remote_summaries(
    client: &ApiClient,
    session: &Session,
    students: &[Student],
) -> anyhow::Result<BTreeMap<String, BTreeMap<CoId, CoSummary>>> {
    let ids: Vec<String> = students.iter().map(|s| s.student_id.clone()).collect();
    let reports = client.fetch_attainment_for_all(session, &ids).await?;
    Ok(reports
        .into_iter()
        .filter_map(|(id, report)| {
            let report = report?;
            let summary = report
                .co_summary
                .into_iter()
                .map(|co| (co.co_id.clone(), co))
                .collect();
            Some((id, summary))
        })
        .collect())
}

fn print_co_summary(summary: &BTreeMap<CoId, CoSummary>, params: &AttainmentParameters) {
    if summary.is_empty() {
        println!("  No CO data.");
        return;
    }
    for co in summary.values() {
        println!(
            "  {}: {:.2}% (Level {}) target {:.0}% {}",
            co.co_id,
            co.avg_attainment,
            attainment::classify(co.avg_attainment, &params.level_thresholds),
            co.target,
            if co.target_attained { "attained" } else { "not attained" }
        );
    }
}

fn print_po_summary(po_summary: &[PoSummary]) {
    for po in po_summary {
        println!(
            "  {}: {:.2}% target {:.0}% {}",
            po.po_id,
            po.attainment,
            po.target,
            if po.target_attained { "attained" } else { "not attained" }
        );
    }
}

fn load_sheets(
    sheets: &[(Category, Option<&Path>)],
) -> anyhow::Result<Vec<attainment::Assessment>> {
    let mut assessments = Vec::new();
    for (category, path) in sheets {
        if let Some(path) = path {
            let loaded = import::load_worksheet(path, *category)?;
            info!(%category, sittings = loaded.len(), "loaded worksheet");
            assessments.extend(loaded);
        }
    }
    Ok(assessments)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let params = AttainmentParameters::load_or_default(cli.params.as_deref())?;
    let config = ApiConfig::from_env();

    match cli.command {
        Commands::Login { email, password } | Commands::Signup { email, password }
            if email.trim().is_empty() || password.is_empty() =>
        {
            bail!("email and password are required");
        }
        Commands::Login { email, password } => {
            let client = ApiClient::new(&config)?;
            let token = client
                .authenticate(&Credentials { email, password }, false)
                .await?;
            println!("{token}");
        }
        Commands::Signup { email, password } => {
            let client = ApiClient::new(&config)?;
            let token = client
                .authenticate(&Credentials { email, password }, true)
                .await?;
            println!("{token}");
        }
        Commands::List {
            student_id,
            name,
            department,
        } => {
            let (client, session) = connect(&config)?;
            let filter = StudentFilter {
                student_id,
                name,
                department,
            };
            let students: Vec<Student> = client
                .list_students(&session)
                .await?
                .into_iter()
                .filter(|student| filter.matches(student))
                .collect();

            if students.is_empty() {
                println!("No students match.");
                return Ok(());
            }

            for student in &students {
                println!(
                    "- {} {} ({}) average {}",
                    student.student_id,
                    student.name,
                    student.department,
                    format_average(student_average(&student.marks))
                );
                let summary =
                    attainment::aggregate(&student.marks, &student.course_outcomes, &params);
                print_co_summary(&summary, &params);
                if let Some(comparison) = three_year_comparison(&student.marks) {
                    println!(
                        "  Last three records: internal {:.2}% ({}), exam {:.2}% ({})",
                        comparison.avg_internal,
                        comparison.internal.label(),
                        comparison.avg_exam,
                        comparison.exam.label()
                    );
                }
            }
        }
        Commands::Summary {
            student_id,
            remote,
            po_matrix,
        } => {
            let (client, session) = connect(&config)?;
            let student = find_student(&client, &session, &student_id).await?;

            println!("{} {} ({})", student.student_id, student.name, student.department);
            println!("Average: {}", format_average(student_average(&student.marks)));
            for point in history(&student.marks) {
                println!(
                    "  {}: internal {:.2}%, exam {:.2}%",
                    point.label, point.internal, point.exam
                );
            }

            let (co_summary, mut po_summary) = if remote {
                let report = client.fetch_attainment(&session, &student_id).await?;
                let co_summary: BTreeMap<CoId, CoSummary> = report
                    .co_summary
                    .into_iter()
                    .map(|co| (co.co_id.clone(), co))
                    .collect();
                (co_summary, report.po_summary)
            } else {
                (
                    attainment::aggregate(&student.marks, &student.course_outcomes, &params),
                    Vec::new(),
                )
            };

            if let Some(path) = po_matrix {
                let matrix = outcomes::load_po_matrix(&path)?;
                if matrix.is_empty() {
                    warn!(path = %path.display(), "PO matrix has no correlations");
                }
                po_summary = outcomes::po_attainment(&matrix, &co_summary, &params);
            }

            println!("CO attainment:");
            print_co_summary(&co_summary, &params);
            if !po_summary.is_empty() {
                println!("PO attainment:");
                print_po_summary(&po_summary);
            }
        }
        Commands::Import { csv, dry_run } => {
            let outcome = import::import_students(&csv)?;
            for rejected in &outcome.rejected {
                println!("Skipped {rejected}");
            }

            if dry_run {
                println!(
                    "Parsed {} students from {} ({} rows skipped).",
                    outcome.students.len(),
                    csv.display(),
                    outcome.rejected.len()
                );
                return Ok(());
            }

            let (client, session) = connect(&config)?;
            let mut created = 0;
            let mut failed = 0;
            for student in &outcome.students {
                match client.create_student(&session, &NewStudent::from(student)).await {
                    Ok(()) => created += 1,
                    Err(ApiError::SessionExpired) => return Err(ApiError::SessionExpired.into()),
                    Err(err) => {
                        warn!(
                            student = %student.student_id,
                            error = %err,
                            "failed to create student"
                        );
                        failed += 1;
                    }
                }
            }
            println!(
                "Created {created} students from {} ({failed} failed, {} rows skipped).",
                csv.display(),
                outcome.rejected.len()
            );
        }
        Commands::Export {
            out,
            format,
            remote,
        } => {
            let (client, session) = connect(&config)?;
            let students = client.list_students(&session).await?;
            let summaries = if remote {
                remote_summaries(&client, &session, &students).await?
            } else {
                local_summaries(&students, &params)
            };
            let groups =
                export::build_export_rows(&students, &summaries, &params.level_thresholds);

            let written = match format {
                ExportFormat::Csv => export::write_csv(&out, &groups)?,
                ExportFormat::Xlsx => export::write_xlsx(&out, &groups)?,
                ExportFormat::Markdown => {
                    let departments = report::summarize_by_department(&students, &summaries);
                    let markdown = report::build_performance_report(
                        chrono::Local::now().date_naive(),
                        &groups,
                        &departments,
                        &summaries,
                    );
                    std::fs::write(&out, markdown)
                        .with_context(|| format!("failed to write {}", out.display()))?;
                    students.len()
                }
            };
            println!("Exported {written} students to {}.", out.display());
        }
        Commands::AdjustTargets {
            student_id,
            dry_run,
        } => {
            let (client, session) = connect(&config)?;
            let student = find_student(&client, &session, &student_id).await?;
            let summary = attainment::aggregate(&student.marks, &student.course_outcomes, &params);

            let current: Vec<CourseOutcomeTarget> = if student.course_outcomes.is_empty() {
                summary
                    .values()
                    .map(|co| CourseOutcomeTarget {
                        co_id: co.co_id.clone(),
                        target: co.target,
                    })
                    .collect()
            } else {
                student.course_outcomes.clone()
            };
            let proposed = targets::adjust(&current, &summary);

            let mut changed = 0;
            for (before, after) in current.iter().zip(&proposed) {
                if after.target != before.target {
                    changed += 1;
                    println!("{}: {:.0}% -> {:.0}%", before.co_id, before.target, after.target);
                }
            }
            if changed == 0 {
                println!("No targets to raise.");
                return Ok(());
            }
            if dry_run {
                println!("Dry run; {changed} targets not saved.");
                return Ok(());
            }

            let update = StudentUpdate {
                marks: None,
                course_outcomes: Some(proposed),
            };
            client.update_student(&session, &student_id, &update).await?;
            println!("Saved {changed} new targets for {student_id}.");
        }
        Commands::Delete { student_id } => {
            let (client, session) = connect(&config)?;
            client.delete_student(&session, &student_id).await?;
            println!("Deleted {student_id}.");
        }
        Commands::Semester {
            internal,
            assignment,
            class_test,
            seminar,
            work_project,
            semester,
            survey,
            targets,
            po_matrix,
            course,
            out,
        } => {
            let assessments = load_sheets(&[
                (Category::InternalExam, internal.as_deref()),
                (Category::Assignment, assignment.as_deref()),
                (Category::ClassTest, class_test.as_deref()),
                (Category::Seminar, seminar.as_deref()),
                (Category::WorkProject, work_project.as_deref()),
                (Category::External, semester.as_deref()),
            ])?;
            let survey = match survey {
                Some(path) => import::load_survey(&path)?,
                None => BTreeMap::new(),
            };

            let breakdowns =
                attainment::aggregate_assessments(&assessments, &survey, &targets, &params);
            let po_summary = match po_matrix {
                Some(path) => {
                    let matrix = outcomes::load_po_matrix(&path)?;
                    let co_summary: BTreeMap<CoId, CoSummary> = breakdowns
                        .iter()
                        .map(|(co_id, breakdown)| (co_id.clone(), breakdown.summary()))
                        .collect();
                    outcomes::po_attainment(&matrix, &co_summary, &params)
                }
                None => Vec::new(),
            };

            let markdown =
                report::build_semester_report(course.as_deref(), &breakdowns, &params, &po_summary);
            print!("{markdown}");
            if let Some(out) = out {
                std::fs::write(&out, &markdown)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::Trends { csv, by } => {
            let marks = trends::load_cohort_marks(&csv)?;
            let cohort = trends::cohort_trends(&marks, by);

            if cohort.points.is_empty() {
                println!("No cohort marks found in {}.", csv.display());
                return Ok(());
            }

            println!("Mean marks by {:?}:", cohort.axis);
            for point in &cohort.points {
                println!(
                    "- {}: {:.2} across {} students (next period {:.2})",
                    point.label, point.current, point.students, point.predicted
                );
            }
            if let Some(forecast) = cohort.forecast {
                println!("Forecast for {}: {:.2}", forecast.label, forecast.predicted);
            }
        }
        Commands::Params => {
            println!("{}", serde_json::to_string_pretty(&params)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_target_flags() {
        let target = parse_target("co2=75%").unwrap();
        assert_eq!(target.co_id.as_str(), "CO2");
        assert_eq!(target.target, 75.0);
        assert!(parse_target("CO1").is_err());
        assert!(parse_target("=70").is_err());
        assert!(parse_target("CO1=140").is_err());
    }

    #[test]
    fn cli_parses_semester_sheets() {
        let cli = Cli::try_parse_from([
            "copo-attainment",
            "semester",
            "--assignment",
            "a.csv",
            "--target",
            "CO1=80",
            "--target",
            "CO2=65",
        ])
        .unwrap();
        match cli.command {
            Commands::Semester {
                assignment, targets, ..
            } => {
                assert_eq!(assignment, Some(PathBuf::from("a.csv")));
                assert_eq!(targets.len(), 2);
            }
            _ => panic!("expected semester"),
        }
    }

    #[test]
    fn semester_requires_a_worksheet() {
        assert!(Cli::try_parse_from(["copo-attainment", "semester", "--survey", "s.csv"]).is_err());
    }

    #[test]
    fn cli_counts_verbosity() {
        let cli = Cli::try_parse_from(["copo-attainment", "-vv", "params"]).unwrap();
        assert_eq!(cli.verbose, 2);
    }
}
