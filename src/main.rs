//! CLI entry point for `zimwriter`.

use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use zimwriter::config::Config;
use zimwriter::format::cluster::Compression;
use zimwriter::store::{split_archive, Archive, ChecksumStatus};
use zimwriter::writer::{DirectorySource, ZimCreator};

#[derive(Parser)]
#[command(
    name = "zimwriter",
    version,
    about = "Build, inspect, verify and split ZIM archives"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Build an archive from a directory tree
    Create {
        /// Directory whose files become the archive's articles
        dir: PathBuf,
        /// Output archive
        #[arg(short, long)]
        output: PathBuf,
        /// Seal a cluster once it holds this many uncompressed bytes
        #[arg(long, value_name = "BYTES", allow_negative_numbers = true)]
        min_chunk_size: Option<i64>,
        /// Do not append a checksum
        #[arg(long)]
        no_checksum: bool,
        /// Cluster compression
        #[arg(long, value_name = "zlib|none")]
        compression: Option<Compression>,
        /// Url (relative to DIR) of the main page
        #[arg(long, value_name = "URL")]
        main_page: Option<String>,
        /// Split the finished archive into parts of at most BYTES
        #[arg(long, value_name = "BYTES")]
        split: Option<u64>,
    },
    /// Show header fields and counts
    Info {
        path: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate the header and recompute the checksum
    Verify { path: PathBuf },
    /// Split an archive into `aa`, `ab`, ... parts
    Split {
        path: PathBuf,
        /// Maximum bytes per part
        #[arg(short, long, value_name = "BYTES")]
        size: u64,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = zimwriter::config::load_config();

    // Configure logging: stderr + optional log file
    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    match cli.command {
        Commands::Create {
            dir,
            output,
            min_chunk_size,
            no_checksum,
            compression,
            main_page,
            split,
        } => cmd_create(
            &config,
            &dir,
            &output,
            CreateOptions {
                min_chunk_size,
                no_checksum,
                compression,
                main_page,
                split,
            },
        ),
        Commands::Info { path, json } => cmd_info(&path, json),
        Commands::Verify { path } => cmd_verify(&path),
        Commands::Split { path, size } => cmd_split(&path, size),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_dir = zimwriter::config::cache_dir(config);
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "zimwriter.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "zimwriter", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Command-line overrides of the `[writer]` and `[split]` config sections.
struct CreateOptions {
    min_chunk_size: Option<i64>,
    no_checksum: bool,
    compression: Option<Compression>,
    main_page: Option<String>,
    split: Option<u64>,
}

/// Build an archive from a directory and print a summary.
fn cmd_create(config: &Config, dir: &Path, output: &Path, opts: CreateOptions) -> anyhow::Result<()> {
    use humansize::{format_size, BINARY};

    if !dir.is_dir() {
        anyhow::bail!("not a directory: {}", dir.display());
    }

    let mut writer_config = config.writer.clone();
    if opts.no_checksum {
        writer_config.checksum = false;
    }
    if let Some(compression) = opts.compression {
        writer_config.compression = compression;
    }
    let mut creator = ZimCreator::with_config(writer_config)?;
    if let Some(size) = opts.min_chunk_size {
        creator.set_min_chunk_size(size)?;
    }

    let mut source = DirectorySource::new(dir)?;
    if let Some(url) = opts.main_page {
        source = source.with_main_page(url);
    }

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} Writing {msg} [{elapsed_precise}]")
            .expect("valid template"),
    );

    let start = Instant::now();
    creator.create_with_progress(
        output,
        source,
        Some(&|items, size| {
            pb.set_message(format!("{items} items, {}", format_size(size, BINARY)));
            pb.tick();
        }),
    )?;
    pb.finish_and_clear();
    let elapsed = start.elapsed();

    let size = creator.current_size()?;
    println!();
    println!("  {:<20} {}", "Archive:", output.display());
    println!("  {:<20} {}", "Size:", format_size(size, BINARY));
    println!("  {:<20} {:.2?}", "Build time:", elapsed);

    let part_size = opts.split.unwrap_or(config.split.part_size);
    if part_size > 0 {
        let parts = split_archive(output, part_size)?;
        std::fs::remove_file(output)?;
        println!("  {:<20} {}", "Parts:", parts.len());
        for part in &parts {
            println!("    {}", part.display());
        }
    }
    println!();
    Ok(())
}

/// Show header fields of an archive.
fn cmd_info(path: &Path, json: bool) -> anyhow::Result<()> {
    let archive = Archive::open(path)?;
    if json {
        print_info_json(path, &archive)
    } else {
        print_info_table(path, &archive);
        Ok(())
    }
}

/// Validate the header and checksum of an archive.
fn cmd_verify(path: &Path) -> anyhow::Result<()> {
    let archive = Archive::open(path)?;
    let start = Instant::now();
    match archive.verify_checksum()? {
        ChecksumStatus::Valid => {
            tracing::info!(path = %path.display(), "Checksum verified");
            println!("{}: OK ({:.2?})", path.display(), start.elapsed());
        }
        ChecksumStatus::Missing => {
            println!("{}: header OK, no checksum stored", path.display());
        }
    }
    Ok(())
}

/// Split an archive into numbered parts.
fn cmd_split(path: &Path, size: u64) -> anyhow::Result<()> {
    let parts = split_archive(path, size)?;
    for part in &parts {
        println!("{}", part.display());
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn page_label(archive: &Archive, page: Option<u32>) -> String {
    match page.map(|index| archive.entry(index)) {
        Some(Ok(entry)) => format!("{}/{}", entry.namespace, entry.url),
        Some(Err(_)) => "<unreadable>".to_string(),
        None => "-".to_string(),
    }
}

/// Print archive information as a table.
fn print_info_table(path: &Path, archive: &Archive) {
    use humansize::{format_size, BINARY};

    let header = archive.header();
    println!();
    println!("  {:<20} {}", "File:", path.display());
    println!("  {:<20} {}", "Size:", format_size(archive.size(), BINARY));
    if archive.part_count() > 1 {
        println!("  {:<20} {}", "Parts:", archive.part_count());
    }
    println!(
        "  {:<20} {}.{}",
        "Version:",
        header.major_version(),
        header.minor_version()
    );
    println!("  {:<20} {}", "UUID:", hex(&header.uuid()));
    println!("  {:<20} {}", "Articles:", header.article_count());
    println!("  {:<20} {}", "Clusters:", header.cluster_count());
    println!(
        "  {:<20} {}",
        "Main page:",
        page_label(archive, header.main_page())
    );
    println!(
        "  {:<20} {}",
        "Layout page:",
        page_label(archive, header.layout_page())
    );
    println!(
        "  {:<20} {}",
        "Checksum:",
        header
            .checksum_pos()
            .map_or("none".to_string(), |pos| format!("at {pos}"))
    );
    if !archive.mime_types().is_empty() {
        println!();
        println!("  Mimetypes:");
        for (i, mime) in archive.mime_types().iter().enumerate() {
            println!("    {i:>4}  {mime}");
        }
    }
    println!();
}

/// Print archive information as JSON.
fn print_info_json(path: &Path, archive: &Archive) -> anyhow::Result<()> {
    let header = archive.header();
    let info = serde_json::json!({
        "file": path.display().to_string(),
        "size": archive.size(),
        "parts": archive.part_count(),
        "major_version": header.major_version(),
        "minor_version": header.minor_version(),
        "uuid": hex(&header.uuid()),
        "article_count": header.article_count(),
        "cluster_count": header.cluster_count(),
        "mime_list_pos": header.mime_list_pos(),
        "url_ptr_pos": header.url_ptr_pos(),
        "title_idx_pos": header.title_idx_pos(),
        "cluster_ptr_pos": header.cluster_ptr_pos(),
        "main_page": header.main_page(),
        "layout_page": header.layout_page(),
        "checksum_pos": header.checksum_pos(),
        "mime_types": archive.mime_types(),
    });
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
