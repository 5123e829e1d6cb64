use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use tessera_spatial::proximity::{
    log_spaced_radii, ProximityConfig, DEFAULT_RADIUS_HIGH, DEFAULT_RADIUS_LOW, DEFAULT_RADIUS_STEPS,
};
use tessera_spatial::{DerivationMethod, EncodingMode, ProximityRecord};
use tessera_stats::correction::CorrectionMethod;
use tessera_stats::ComparisonConfig;
use tessera_store::{DbCredentials, ExportOptions, Store};
use tessera_workflow::{
    compare_cohorts, run_analysis, write_comparisons, write_comparisons_file, Analysis, CohortOptions, IndexKind,
    PipelineConfig, RunReport,
};

#[derive(Parser)]
#[command(name = "tessera")]
#[command(about = "Spatial analytics over multiplexed tissue-imaging cell tables", long_about = None)]
struct Cli {
    /// INI file with a [database-credentials] section
    #[arg(long, global = true, value_name = "FILE")]
    database_config_file: Option<PathBuf>,

    /// Override the database named in the credentials file
    #[arg(long, global = true)]
    database_name: Option<String>,

    /// One of error, warn, info, debug, trace
    #[arg(long, global = true, default_value = "info")]
    log_level: Level,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Execution {
    /// Study to analyze
    #[arg(long)]
    study: String,

    /// Worker threads (defaults to one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Spatial index: kd-tree or brute-force
    #[arg(long, default_value = "kd-tree")]
    index: IndexKind,

    /// Store zeros for (specimen, feature) pairs without a value
    #[arg(long)]
    impute_zeros: bool,
}

impl Execution {
    fn config(&self) -> PipelineConfig {
        PipelineConfig {
            threads: self.threads,
            index: self.index,
            impute_zeros: self.impute_zeros,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// List the sample strata of each study
    ExploreClasses {
        #[arg(long)]
        study: Option<String>,
    },
    /// Write per-specimen TSV matrices and features.json
    RetrieveFeatureMatrices {
        #[arg(long)]
        study: Option<String>,
        /// Directory receiving the files
        #[arg(long, default_value = ".")]
        output_dir: PathBuf,
        /// One integer `expression` column instead of one column per channel
        #[arg(long)]
        packed: bool,
        /// Add `I <symbol>` intensity columns
        #[arg(long)]
        intensities: bool,
        /// Leave out the composite phenotype columns
        #[arg(long)]
        no_phenotypes: bool,
    },
    /// Assign unassigned specimens to sample strata
    CreateStrata,
    /// Phenotype proximity for every specimen of a study
    ComputeProximity {
        #[command(flatten)]
        execution: Execution,
        /// Radii in pixels (comma separated); log-spaced 10..100 by default
        #[arg(long, value_delimiter = ',')]
        radii: Option<Vec<u32>>,
        /// Neighbor pairs per unit compartment area instead of per source cell
        #[arg(long)]
        balanced: bool,
        /// Compartments evaluated besides "all"
        #[arg(long, value_delimiter = ',')]
        compartments: Option<Vec<String>>,
        /// Write every metric, all compartments included, as TSV
        #[arg(long, value_name = "FILE")]
        output_tsv: Option<PathBuf>,
    },
    /// Distance of cells to the nearest cell of another compartment
    ComputeFrontProximity {
        #[command(flatten)]
        execution: Execution,
        #[arg(long, value_delimiter = ',')]
        compartments: Option<Vec<String>>,
    },
    /// Moran's I of channel positivity over a radius graph
    ComputeAutocorrelation {
        #[command(flatten)]
        execution: Execution,
        #[arg(long, default_value_t = tessera_spatial::autocorrelation::DEFAULT_AUTOCORRELATION_RADIUS)]
        radius: f64,
    },
    /// Compare strata over one derivation method's feature values
    CompareCohorts {
        #[arg(long)]
        study: String,
        /// e.g. "proximity", "front proximity"
        #[arg(long)]
        derivation_method: DerivationMethod,
        /// bonferroni or bh
        #[arg(long)]
        correction: Option<CorrectionMethod>,
        #[arg(long, default_value_t = 0.01)]
        significance_level: f64,
        #[arg(long, default_value_t = 3)]
        min_group_size: usize,
        /// Record the tests in the store
        #[arg(long)]
        persist: bool,
        /// TSV output file; stdout otherwise
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Delete the stored values of one derivation method
    PurgeFeatures {
        #[arg(long)]
        study: String,
        #[arg(long)]
        derivation_method: DerivationMethod,
    },
}

fn open_store(cli: &Cli) -> anyhow::Result<Store> {
    let Some(path) = &cli.database_config_file else {
        bail!("--database-config-file is required");
    };
    let mut credentials = DbCredentials::from_file(path)?;
    if let Some(name) = &cli.database_name {
        credentials = credentials.update_database(name);
    }
    Ok(Store::from_credentials(&credentials)?)
}

fn report(run: &RunReport) {
    info!(
        derivation_method = %run.derivation_method,
        study = %run.analysis_study,
        specimens = run.specimens,
        skipped = run.skipped.len(),
        outcome = ?run.outcome,
        "done"
    );
}

fn write_proximity_tsv(path: &Path, records: &[(String, ProximityRecord)]) -> anyhow::Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(path)
        .with_context(|| format!("creating {}", path.display()))?;
    writer.write_record(["specimen", "source", "target", "compartment", "radius", "value"])?;
    for (specimen, r) in records {
        writer.write_record([
            specimen.clone(),
            r.source.clone(),
            r.target.clone(),
            r.compartment.clone(),
            r.radius.to_string(),
            r.value.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let mut store = open_store(&cli)?;
    match &cli.command {
        Commands::ExploreClasses { study } => {
            let studies = match study {
                Some(s) => vec![s.clone()],
                None => store.study_names()?,
            };
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for study in studies {
                writeln!(out, "{}", study)?;
                for s in store.strata(&study)? {
                    writeln!(out, "  {}\t{}\t({} samples)", s.identifier, s.label, s.sample_count)?;
                }
            }
        }
        Commands::RetrieveFeatureMatrices {
            study,
            output_dir,
            packed,
            intensities,
            no_phenotypes,
        } => {
            let options = ExportOptions {
                mode: if *packed { EncodingMode::Packed } else { EncodingMode::Expanded },
                include_intensities: *intensities,
                include_phenotypes: !*no_phenotypes,
                study: study.clone(),
            };
            let summary = store.export_feature_matrices(output_dir, &options)?;
            info!(files = summary.written.len(), skipped = summary.skipped_specimens.len(), "exported");
        }
        Commands::CreateStrata => {
            let assigned = store.create_strata()?;
            info!(assigned = assigned.len(), "strata created");
        }
        Commands::ComputeProximity {
            execution,
            radii,
            balanced,
            compartments,
            output_tsv,
        } => {
            let config = ProximityConfig {
                radii: radii
                    .clone()
                    .unwrap_or_else(|| log_spaced_radii(DEFAULT_RADIUS_LOW, DEFAULT_RADIUS_HIGH, DEFAULT_RADIUS_STEPS)),
                balanced: *balanced,
                compartments: compartments.clone(),
            };
            if config.radii.is_empty() {
                bail!("at least one radius is required");
            }
            let run = run_analysis(&mut store, &execution.study, &Analysis::Proximity(config), &execution.config())?;
            if let Some(path) = output_tsv {
                write_proximity_tsv(path, &run.proximity)?;
            }
            report(&run);
        }
        Commands::ComputeFrontProximity { execution, compartments } => {
            let analysis = Analysis::FrontProximity {
                compartments: compartments.clone(),
            };
            let run = run_analysis(&mut store, &execution.study, &analysis, &execution.config())?;
            report(&run);
        }
        Commands::ComputeAutocorrelation { execution, radius } => {
            if radius.is_nan() || *radius <= 0.0 {
                bail!("radius must be positive, got {}", radius);
            }
            let analysis = Analysis::Autocorrelation { radius: *radius };
            let run = run_analysis(&mut store, &execution.study, &analysis, &execution.config())?;
            report(&run);
        }
        Commands::CompareCohorts {
            study,
            derivation_method,
            correction,
            significance_level,
            min_group_size,
            persist,
            output,
        } => {
            let options = CohortOptions {
                comparison: ComparisonConfig {
                    min_group_size: *min_group_size,
                    significance_level: *significance_level,
                    ..Default::default()
                },
                correction: *correction,
                persist: *persist,
            };
            let comparisons = compare_cohorts(&mut store, study, *derivation_method, &options)?;
            match output {
                Some(path) => write_comparisons_file(path, &comparisons)?,
                None => write_comparisons(std::io::stdout().lock(), &comparisons)?,
            }
        }
        Commands::PurgeFeatures {
            study,
            derivation_method,
        } => {
            let components = store.study_components(study)?;
            let deleted = store.purge_features(*derivation_method, &components.analysis_study_name())?;
            info!(derivation_method = %derivation_method, deleted, "purged feature values");
        }
    }
    Ok(())
}
