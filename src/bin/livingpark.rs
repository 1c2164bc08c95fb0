use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use livingpark_utils::app::{App, T1Options};
use livingpark_utils::cache::NiftiCache;
use livingpark_utils::clinical;
use livingpark_utils::cohort::{self, CohortEntry};
use livingpark_utils::config::{ConfigLoader, ResolvedConfig};
use livingpark_utils::convert::{Dcm2niixConverter, NiftiConverter};
use livingpark_utils::domain::{DownloaderKind, MatchPolicy, StudyFileIdentifier, SubjectId};
use livingpark_utils::error::LivingParkError;
use livingpark_utils::output::{HumanOutput, JsonOutput, OutputMode};
use livingpark_utils::ppmi::{DownloadInfo, PpmiClient, PpmiHttpClient};
use livingpark_utils::store::Store;

#[derive(Parser)]
#[command(name = "livingpark")]
#[command(about = "Download and locate PPMI data for LivingPark notebooks")]
#[command(version, author)]
struct Cli {
    /// Path to a livingpark.json config file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Download the T1 images of a cohort into the cache")]
    GetT1NiftiFiles(GetT1Args),
    #[command(about = "Look up a cached NIfTI image")]
    Find(FindArgs),
    #[command(about = "Download PPMI study files")]
    StudyFiles(StudyFilesArgs),
    #[command(about = "Compute disease duration at each MDS-UPDRS Part III exam")]
    DiseaseDuration(DiseaseDurationArgs),
    #[command(about = "Convert a MoCA score to MMSE")]
    Moca2mmse(Moca2MmseArgs),
    #[command(about = "Print the identifier of a cohort")]
    CohortId(CohortIdArgs),
    #[command(about = "Select sagittal T1 scans from the imaging metadata")]
    MriMetadata(MriMetadataArgs),
    #[command(about = "Create the notebook cache and its inputs/outputs links")]
    Init(InitArgs),
}

#[derive(Args)]
struct GetT1Args {
    /// Cohort CSV with PATNO, EVENT_ID and Description columns.
    cohort: PathBuf,

    #[arg(long, value_enum, default_value_t = DownloaderKind::Ppmi)]
    downloader: DownloaderKind,

    #[arg(long, action = ArgAction::Set, default_value_t = true)]
    symlink: bool,

    #[arg(long, action = ArgAction::Set, default_value_t = false)]
    force: bool,

    /// Download timeout per subject, in seconds.
    #[arg(long, default_value_t = 120)]
    timeout: u64,

    /// Subjects requested per imaging download.
    #[arg(long, default_value_t = 50)]
    batch_size: usize,

    /// Write the cohort with its `File name` column filled in.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct FindArgs {
    subject: String,
    visit: String,
    description: String,

    #[arg(long, value_enum)]
    policy: Option<MatchPolicy>,
}

#[derive(Args)]
struct StudyFilesArgs {
    #[arg(required = true)]
    files: Vec<String>,

    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct DiseaseDurationArgs {
    #[arg(long)]
    force: bool,

    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct Moca2MmseArgs {
    score: u32,
}

#[derive(Args)]
struct CohortIdArgs {
    cohort: PathBuf,
}

#[derive(Args)]
struct MriMetadataArgs {
    #[arg(long)]
    input: Option<PathBuf>,

    #[arg(long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct InitArgs {
    /// Do not create the inputs/outputs links.
    #[arg(long)]
    no_link: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<LivingParkError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &LivingParkError) -> u8 {
    match error {
        LivingParkError::InvalidSubjectId(_)
        | LivingParkError::InvalidVisitId(_)
        | LivingParkError::InvalidDescription(_)
        | LivingParkError::InvalidMocaScore(_)
        | LivingParkError::InvalidTissueClass(_)
        | LivingParkError::InvalidDate(_)
        | LivingParkError::CacheRootMissing(_)
        | LivingParkError::CacheRootInaccessible { .. }
        | LivingParkError::ConfigRead(_)
        | LivingParkError::ConfigParse(_)
        | LivingParkError::MissingColumn { .. }
        | LivingParkError::MissingStudyFiles(_) => 2,
        LivingParkError::PpmiHttp(_)
        | LivingParkError::PpmiStatus { .. }
        | LivingParkError::PpmiTimeout(_)
        | LivingParkError::MissingTool(_)
        | LivingParkError::FileConversion(_) => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::GetT1NiftiFiles(args) => {
            let app = online_app(&config)?;
            run_get_t1(args, app, output_mode)
        }
        Commands::Find(args) => run_find(args, &config, output_mode),
        Commands::StudyFiles(args) => {
            let app = online_app(&config)?;
            let result = match output_mode {
                OutputMode::Json => {
                    app.install_study_files(&args.files, args.force, config.ppmi.timeout, &JsonOutput)?
                }
                OutputMode::Human => {
                    app.install_study_files(&args.files, args.force, config.ppmi.timeout, &HumanOutput)?
                }
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic()?,
                OutputMode::Human => HumanOutput::print_study_files(&result).into_diagnostic()?,
            }
            if !result.missing.is_empty() {
                return Err(LivingParkError::MissingStudyFiles(result.missing).into());
            }
            Ok(())
        }
        Commands::DiseaseDuration(args) => {
            let app = online_app(&config)?;
            let output = args.output.as_deref();
            match output_mode {
                OutputMode::Json => {
                    let result =
                        app.disease_duration(args.force, config.ppmi.timeout, output, &JsonOutput)?;
                    JsonOutput::print(&result).into_diagnostic()
                }
                OutputMode::Human => {
                    let result =
                        app.disease_duration(args.force, config.ppmi.timeout, output, &HumanOutput)?;
                    HumanOutput::print_disease_duration(&result).into_diagnostic()
                }
            }
        }
        Commands::Moca2mmse(args) => {
            let mmse = clinical::moca_to_mmse(args.score)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&serde_json::json!({
                    "moca": args.score,
                    "mmse": mmse,
                }))
                .into_diagnostic(),
                OutputMode::Human => {
                    println!("{mmse}");
                    Ok(())
                }
            }
        }
        Commands::CohortId(args) => {
            let entries = cohort::read_cohort(&args.cohort)?;
            let id = cohort::cohort_id(&entries);
            match output_mode {
                OutputMode::Json => JsonOutput::print(&serde_json::json!({
                    "cohort_id": id,
                    "subjects": entries.len(),
                }))
                .into_diagnostic(),
                OutputMode::Human => {
                    println!("{id}");
                    Ok(())
                }
            }
        }
        Commands::MriMetadata(args) => {
            let app = online_app(&config)?;
            let input = args.input.as_deref();
            let output = args.output.as_deref();
            match output_mode {
                OutputMode::Json => {
                    let result = app.mri_metadata(input, output, config.ppmi.timeout, &JsonOutput)?;
                    JsonOutput::print(&result).into_diagnostic()
                }
                OutputMode::Human => {
                    let result = app.mri_metadata(input, output, config.ppmi.timeout, &HumanOutput)?;
                    HumanOutput::print_mri_metadata(&result).into_diagnostic()
                }
            }
        }
        Commands::Init(args) => {
            let app = offline_app(&config);
            let result = app.init(!args.no_link)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
                OutputMode::Human => HumanOutput::print_setup(&result).into_diagnostic(),
            }
        }
    }
}

fn online_app(config: &ResolvedConfig) -> miette::Result<App<PpmiHttpClient, Dcm2niixConverter>> {
    let ppmi = PpmiHttpClient::new(&config.ppmi)?;
    Ok(App::new(
        Store::from_config(config),
        NiftiCache::from_config(config),
        ppmi,
        Dcm2niixConverter::new(),
    ))
}

fn offline_app(config: &ResolvedConfig) -> App<NopPpmi, NopConverter> {
    App::new(
        Store::from_config(config),
        NiftiCache::from_config(config),
        NopPpmi,
        NopConverter,
    )
}

fn run_get_t1<P: PpmiClient, C: NiftiConverter>(
    args: GetT1Args,
    app: App<P, C>,
    output_mode: OutputMode,
) -> miette::Result<()> {
    let GetT1Args {
        cohort: cohort_path,
        downloader,
        symlink,
        force,
        timeout,
        batch_size,
        output,
    } = args;
    tracing::info!(%downloader, cohort = %cohort_path.display(), "fetching T1 images");

    let entries = cohort::read_cohort(&cohort_path)?;
    let options = T1Options {
        symlink,
        force,
        timeout: Duration::from_secs(timeout),
        batch_size,
    };

    let result = match output_mode {
        OutputMode::Json => app.get_t1_nifti_files(&entries, options, &JsonOutput)?,
        OutputMode::Human => app.get_t1_nifti_files(&entries, options, &HumanOutput)?,
    };
    if let Some(output) = output {
        let rows = result
            .success
            .iter()
            .chain(&result.missing)
            .cloned()
            .collect::<Vec<CohortEntry>>();
        cohort::write_cohort(&output, &rows)?;
    }

    match output_mode {
        OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_t1(&result).into_diagnostic(),
    }
}

fn run_find(args: FindArgs, config: &ResolvedConfig, output_mode: OutputMode) -> miette::Result<()> {
    let id = StudyFileIdentifier::new(&args.subject, &args.visit, &args.description)?;
    let cache = NiftiCache::new(
        config.cache_root.clone(),
        config.base_dir.clone(),
        config.layout,
        args.policy.unwrap_or(config.match_policy),
    );
    let app = App::new(Store::from_config(config), cache, NopPpmi, NopConverter);
    let result = app.lookup(&id)?;
    match output_mode {
        OutputMode::Json => JsonOutput::print(&result).into_diagnostic(),
        OutputMode::Human => HumanOutput::print_lookup(&result).into_diagnostic(),
    }
}

struct NopPpmi;
struct NopConverter;

impl PpmiClient for NopPpmi {
    fn download_study_file(
        &self,
        _name: &str,
        _destination_dir: &Path,
        _timeout: Duration,
    ) -> Result<PathBuf, LivingParkError> {
        Err(LivingParkError::PpmiHttp("offline command".to_string()))
    }

    fn download_imaging(
        &self,
        _subjects: &[SubjectId],
        _destination: &Path,
        _timeout: Duration,
    ) -> Result<DownloadInfo, LivingParkError> {
        Err(LivingParkError::PpmiHttp("offline command".to_string()))
    }
}

impl NiftiConverter for NopConverter {
    fn convert(
        &self,
        _dicom_files: &[PathBuf],
        _output_dir: &Path,
    ) -> Result<Vec<PathBuf>, LivingParkError> {
        Err(LivingParkError::MissingTool("dcm2niix".to_string()))
    }

    fn tool_version(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_t1_defaults() {
        let cli = Cli::try_parse_from(["livingpark", "get-t1-nifti-files", "cohort.csv"]).unwrap();
        let Commands::GetT1NiftiFiles(args) = cli.command else {
            panic!("expected get-t1-nifti-files");
        };
        assert_eq!(args.batch_size, 50);
        assert_eq!(args.timeout, 120);
        assert!(args.symlink);
        assert!(!args.force);
    }
}
