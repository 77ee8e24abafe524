use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};

use astrosolve::geom::sphere::arcsec_to_rad;
use astrosolve::index::builder::{build_index_from_catalog, IndexBuilderConfig};
use astrosolve::index::Index;
use astrosolve::{FieldStar, IndexCatalog, SolverPolicy, SolverSession};

#[derive(Parser)]
#[command(name = "astrosolve", about = "Plate solver over prebuilt star indexes")]
struct Cli {
    /// Log verbosity: 0 silent, 1 errors, 2 progress, 3 debug, 4 trace.
    #[arg(short, long, default_value_t = 2, value_parser = clap::value_parser!(i32).range(0..=4))]
    verbosity: i32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Solve a JSON source list (`[{"x": .., "y": .., "flux": ..}, ...]`).
    Solve {
        sources: PathBuf,

        /// Policy file naming the sky system and index files.
        #[arg(short, long)]
        policy: Option<PathBuf>,

        /// Additional index file(s). Can be repeated.
        #[arg(short, long)]
        index: Vec<PathBuf>,

        /// Pixel scale range in arcsec/pixel (e.g. "0.5,5.0").
        #[arg(long, conflicts_with = "scale")]
        scale_range: Option<String>,

        /// Known pixel scale in arcsec/pixel, searched within one percent.
        #[arg(long)]
        scale: Option<f64>,

        /// 0 normal, 1 flipped, 2 either.
        #[arg(long, default_value = "2")]
        parity: i32,

        /// Image size in pixels (e.g. "4096,4096"); the source extent if omitted.
        #[arg(long)]
        image_size: Option<String>,

        /// RA of the expected field center, degrees.
        #[arg(long, requires = "dec")]
        ra: Option<f64>,

        /// Dec of the expected field center, degrees.
        #[arg(long, requires = "ra")]
        dec: Option<f64>,

        /// Only match with this many of the brightest sources.
        #[arg(long)]
        bright_limit: Option<usize>,

        /// Log-odds threshold to accept a solution.
        #[arg(long)]
        log_odds_accept: Option<f64>,

        /// SIP distortion order to report; 0 reports the linear solution only.
        #[arg(long, default_value = "2")]
        sip_order: usize,

        /// Write the matched sources here as JSON.
        #[arg(long)]
        matches: Option<PathBuf>,

        /// Name of the magnitude column matched fluxes are derived from.
        #[arg(long, default_value = "mag")]
        mag_column: String,
    },

    /// Build an index from a starfield binary catalog.
    BuildIndex {
        /// Path to a starfield binary catalog file.
        #[arg(short, long)]
        catalog: PathBuf,

        /// Output path for the index file.
        #[arg(short, long)]
        output: PathBuf,

        #[arg(long, default_value = "0")]
        index_id: u32,

        /// Minimum quad scale in arcseconds.
        #[arg(long, default_value = "30.0")]
        scale_lower: f64,

        /// Maximum quad scale in arcseconds.
        #[arg(long, default_value = "1800.0")]
        scale_upper: f64,

        /// Restrict to one HEALPix cell at this nside (0 = all sky).
        #[arg(long, default_value = "0")]
        nside: u32,

        #[arg(long, default_value = "0")]
        healpix: u64,

        /// Brightest stars kept.
        #[arg(long, default_value = "10000")]
        max_stars: usize,

        #[arg(long, default_value = "1000000")]
        max_quads: usize,

        /// Catalog positional uncertainty in arcseconds.
        #[arg(long, default_value = "1.0")]
        jitter: f64,
    },

    /// Print index metadata without loading star data.
    Inspect {
        #[arg(required = true)]
        index: Vec<PathBuf>,
    },

    /// Write a JSON metadata cache for a policy's index files.
    Cache {
        #[arg(short, long)]
        policy: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{message}");
    process::exit(1);
}

fn init_logging(verbosity: i32) {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Trace)
        .format_timestamp_millis()
        .init();
    if let Err(e) = astrosolve::set_log_level(verbosity) {
        fail(e);
    }
}

fn parse_pair(s: &str, what: &str) -> (f64, f64) {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 2 {
        fail(format!("{what} must be two comma-separated values (e.g. \"0.5,5.0\")"));
    }
    let parse = |p: &str| {
        p.trim()
            .parse::<f64>()
            .unwrap_or_else(|_| fail(format!("invalid {what} value: {p}")))
    };
    (parse(parts[0]), parse(parts[1]))
}

fn load_policy(path: &Path) -> SolverPolicy {
    SolverPolicy::load(path).unwrap_or_else(|e| fail(e))
}

#[allow(clippy::too_many_arguments)]
fn cmd_solve(
    sources_path: &Path,
    policy_path: Option<&Path>,
    index_paths: &[PathBuf],
    scale_range: Option<(f64, f64)>,
    scale: Option<f64>,
    parity: i32,
    image_size: Option<(f64, f64)>,
    position: Option<(f64, f64)>,
    bright_limit: Option<usize>,
    log_odds_accept: Option<f64>,
    sip_order: usize,
    matches_path: Option<&Path>,
    mag_column: &str,
) {
    let text = fs::read_to_string(sources_path)
        .unwrap_or_else(|e| fail(format!("failed to read {}: {e}", sources_path.display())));
    let sources: Vec<FieldStar> = serde_json::from_str(&text)
        .unwrap_or_else(|e| fail(format!("failed to parse {}: {e}", sources_path.display())));
    eprintln!("Loaded {} sources", sources.len());

    let mut policy = policy_path.map(load_policy).unwrap_or_default();
    policy.index_files.extend(index_paths.iter().cloned());
    let mut session = SolverSession::new(&policy);
    eprintln!("Loaded {} index(es)", session.catalog().len());

    let configure = |session: &mut SolverSession| -> Result<(), astrosolve::SolverError> {
        session.set_field(&sources)?;
        session.set_parity_code(parity)?;
        if let Some((lo, hi)) = scale_range {
            session.set_minimum_image_scale(lo)?;
            session.set_maximum_image_scale(hi)?;
        }
        if let Some(scale) = scale {
            session.set_image_scale(scale)?;
        }
        if let Some((w, h)) = image_size {
            session.set_image_size(w, h)?;
        }
        if let Some(n) = bright_limit {
            session.set_bright_limit(n)?;
        }
        if let Some(threshold) = log_odds_accept {
            session.set_match_threshold(threshold)?;
        }
        Ok(())
    };
    configure(&mut session).unwrap_or_else(|e| fail(e));

    let solved = match position {
        Some((ra, dec)) => session.solve_near(ra, dec),
        None => session.solve_blind(),
    }
    .unwrap_or_else(|e| fail(format!("{e} ({:?} error)", e.kind())));
    if !solved {
        fail("No solution found.");
    }

    let wcs = session.get_wcs().unwrap_or_else(|e| fail(e));
    let (ra, dec) = wcs.center_deg();
    let result = session.match_result().unwrap_or_else(|| fail("solution missing"));
    println!("Solved with index {}", result.index_name);
    println!("  Center: RA={ra:.6} deg, Dec={dec:.6} deg");
    println!("  Pixel scale: {:.4} arcsec/pixel", wcs.pixel_scale_arcsec());
    println!(
        "  Matches: {} ({} conflicts, {} unmatched), log-odds {:.1}",
        result.counts.matched, result.counts.conflict, result.counts.distractor, result.log_odds
    );

    let cards = if sip_order > 0 {
        match session.get_distorted_wcs(sip_order) {
            Ok(sip) => sip.header_cards(),
            Err(e) => {
                eprintln!("Distortion fit failed, reporting linear solution: {e}");
                wcs.header_cards()
            }
        }
    } else {
        wcs.header_cards()
    };
    for (key, value) in &cards {
        let value = serde_json::to_string(value).unwrap_or_default();
        println!("  {key:<8} = {value}");
    }

    if let Some(path) = matches_path {
        let matches = session
            .matched_sources(Some(mag_column))
            .or_else(|e| {
                eprintln!("{e}; writing matches without catalog flux");
                session.matched_sources(None)
            })
            .unwrap_or_else(|e| fail(e));
        let json = serde_json::to_string_pretty(&matches).unwrap_or_else(|e| fail(e));
        fs::write(path, json)
            .unwrap_or_else(|e| fail(format!("failed to write {}: {e}", path.display())));
        eprintln!("Wrote {} matches to {}", matches.len(), path.display());
    }
}

fn cmd_build_index(catalog_path: &Path, output_path: &Path, config: &IndexBuilderConfig) {
    use starfield::catalogs::MinimalCatalog;

    let catalog = MinimalCatalog::load(catalog_path)
        .unwrap_or_else(|e| fail(format!("Failed to load catalog {}: {e}", catalog_path.display())));
    eprintln!("Loaded catalog: {} stars", catalog.len());

    let index = build_index_from_catalog(&catalog, config);
    eprintln!(
        "Built index: {} stars, {} quads",
        index.meta.n_stars, index.meta.n_quads
    );

    index
        .save(output_path)
        .unwrap_or_else(|e| fail(format!("Failed to save index {}: {e}", output_path.display())));
    eprintln!("Saved index to {}", output_path.display());
}

fn cmd_inspect(paths: &[PathBuf]) {
    for path in paths {
        let index = Index::open(path).unwrap_or_else(|e| fail(e));
        let meta = &index.meta;
        println!("{}", path.display());
        println!("  id {}, healpix {}, nside {}", meta.index_id, meta.healpix, meta.nside);
        println!(
            "  quad scale {:.1}..{:.1} arcsec",
            meta.scale_lower.to_degrees() * 3600.0,
            meta.scale_upper.to_degrees() * 3600.0
        );
        println!("  {} stars, {} quads", meta.n_stars, meta.n_quads);
        if meta.tag_along.is_empty() {
            println!("  no tag-along columns");
        } else {
            println!("  columns: {}", meta.tag_along.join(", "));
        }
    }
}

fn cmd_cache(policy_path: &Path, output_path: &Path) {
    let policy = load_policy(policy_path);
    let files = policy.resolved_index_files();
    let catalog = IndexCatalog::load_metadata(&files[..]);
    catalog.write_cache(output_path).unwrap_or_else(|e| fail(e));
    eprintln!("Cached metadata of {} index(es) to {}", catalog.len(), output_path.display());
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbosity);

    match &cli.command {
        Commands::Solve {
            sources,
            policy,
            index,
            scale_range,
            scale,
            parity,
            image_size,
            ra,
            dec,
            bright_limit,
            log_odds_accept,
            sip_order,
            matches,
            mag_column,
        } => {
            let sr = scale_range.as_deref().map(|s| parse_pair(s, "scale-range"));
            let size = image_size.as_deref().map(|s| parse_pair(s, "image-size"));
            let position = ra.zip(*dec);
            cmd_solve(
                sources,
                policy.as_deref(),
                index,
                sr,
                *scale,
                *parity,
                size,
                position,
                *bright_limit,
                *log_odds_accept,
                *sip_order,
                matches.as_deref(),
                mag_column,
            );
        }
        Commands::BuildIndex {
            catalog,
            output,
            index_id,
            scale_lower,
            scale_upper,
            nside,
            healpix,
            max_stars,
            max_quads,
            jitter,
        } => {
            if *nside != 0 && !astrosolve::healpix::is_valid_nside(*nside) {
                fail(format!("nside must be a power of two, got {nside}"));
            }
            let name = output
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "index".to_string());
            let config = IndexBuilderConfig {
                index_id: *index_id,
                name,
                healpix: *healpix,
                nside: *nside,
                scale_lower: arcsec_to_rad(*scale_lower),
                scale_upper: arcsec_to_rad(*scale_upper),
                max_stars: *max_stars,
                max_quads: *max_quads,
                jitter_arcsec: *jitter,
                extra_columns: Vec::new(),
            };
            cmd_build_index(catalog, output, &config);
        }
        Commands::Inspect { index } => cmd_inspect(index),
        Commands::Cache { policy, output } => cmd_cache(policy, output),
    }
}
