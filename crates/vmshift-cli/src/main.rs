//! vmshift CLI - Inspect, filter and template virtual machine descriptors.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rayon::prelude::*;
use tracing_subscriber::EnvFilter;
use vmshift_core::{
    detect_file, probe, DetectedConfiguration, OsCatalog, OsInfoDatabase, ParseContext,
    VirtualBoxConfig, VirtualizationConfiguration,
};

/// Normalize virtual machine descriptors across hypervisors.
#[derive(Parser)]
#[command(name = "vmshift")]
#[command(version, about, long_about = None)]
struct Cli {
    /// JSON file with the canonical operating system catalog.
    #[arg(long, global = true)]
    os_catalog: Option<PathBuf>,

    /// JSON file with the OS fingerprint database (libvirt only).
    #[arg(long, global = true)]
    osinfo_db: Option<PathBuf>,

    /// Log parse decisions (equivalent to RUST_LOG=debug).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify disk images and report their headers.
    Probe {
        /// Disk image files (VMDK, VDI, QCOW2).
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Display the normalized view of a machine descriptor.
    Info {
        /// Path to the descriptor (.vmx, .vbox, libvirt XML, container archive).
        config: PathBuf,
    },

    /// Strip storage paths and write the shareable subset of a descriptor.
    Filter {
        config: PathBuf,

        /// Output file. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Turn a VirtualBox settings file into a reusable template.
    Template {
        /// Path to the .vbox file.
        vbox_file: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Prepare a descriptor for interactive editing.
    Edit {
        config: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Prepare a descriptor for stateless execution.
    Stateless {
        config: PathBuf,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Probe { files } => {
            probe_disks(&files)?;
        }
        Commands::Info { config } => {
            let ctx = load_context(cli.os_catalog.as_deref(), cli.osinfo_db.as_deref())?;
            show_info(&config, &ctx)?;
        }
        Commands::Filter { config, output } => {
            let ctx = load_context(cli.os_catalog.as_deref(), cli.osinfo_db.as_deref())?;
            let mut detected = open_config(&config, &ctx)?;
            let config = detected.config_mut();
            config.transform_privacy();
            write_output(output.as_deref(), &config.filtered_definition_bytes()?)?;
        }
        Commands::Template { vbox_file, output } => {
            let ctx = load_context(cli.os_catalog.as_deref(), cli.osinfo_db.as_deref())?;
            let vbox = VirtualBoxConfig::parse_file(&vbox_file, &ctx)
                .with_context(|| format!("Failed to parse {}", vbox_file.display()))?;
            let template = vbox.create_template()?;
            write_output(output.as_deref(), &template.definition_bytes()?)?;
        }
        Commands::Edit { config, output } => {
            let ctx = load_context(cli.os_catalog.as_deref(), cli.osinfo_db.as_deref())?;
            let mut detected = open_config(&config, &ctx)?;
            let config = detected.config_mut();
            config.transform_editable();
            write_output(output.as_deref(), &config.definition_bytes()?)?;
        }
        Commands::Stateless { config, output } => {
            let ctx = load_context(cli.os_catalog.as_deref(), cli.osinfo_db.as_deref())?;
            let mut detected = open_config(&config, &ctx)?;
            let config = detected.config_mut();
            config.transform_non_persistent();
            write_output(output.as_deref(), &config.definition_bytes()?)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_context(os_catalog: Option<&Path>, osinfo_db: Option<&Path>) -> Result<ParseContext> {
    let catalog = match os_catalog {
        Some(path) => OsCatalog::from_json_file(path)?,
        None => OsCatalog::default(),
    };
    let osinfo = match osinfo_db {
        Some(path) => OsInfoDatabase::from_json_file(path)?,
        None => OsInfoDatabase::default(),
    };
    Ok(ParseContext::new(catalog, osinfo))
}

fn open_config(path: &Path, ctx: &ParseContext) -> Result<DetectedConfiguration> {
    detect_file(path, ctx).with_context(|| format!("Failed to read {}", path.display()))
}

fn write_output(output: Option<&Path>, bytes: &[u8]) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write {}", path.display()))?,
        None => std::io::stdout().write_all(bytes)?,
    }
    Ok(())
}

fn probe_disks(files: &[PathBuf]) -> Result<()> {
    tracing::debug!(count = files.len(), "probing disk images");
    let results: Vec<_> = files.par_iter().map(|path| (path, probe(path))).collect();

    let mut failed = 0;
    for (path, result) in results {
        match result {
            Ok(image) => {
                let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
                println!("{}", path.display());
                println!("  Format:     {}", image.format.extension());
                println!("  Size:       {}", format_bytes(size));
                if let Some(sub_format) = &image.sub_format {
                    println!("  Subformat:  {}", sub_format);
                }
                println!("  Version:    {}", image.hw_version);
                println!("  Standalone: {}", yes_no(image.is_standalone));
                println!("  Compressed: {}", yes_no(image.is_compressed));
                println!("  Snapshot:   {}", yes_no(image.is_snapshot));
                if let Some(description) = image.description.as_deref().filter(|d| !d.is_empty()) {
                    println!("  Description: {}", description);
                }
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", path.display(), e);
            }
        }
    }

    if failed > 0 {
        anyhow::bail!("{} of {} images could not be probed", failed, files.len());
    }
    Ok(())
}

fn show_info(path: &Path, ctx: &ParseContext) -> Result<()> {
    let detected = open_config(path, ctx)?;
    let config = detected.config();

    println!("Machine Information");
    println!("===================");
    println!();
    println!("Name:        {}", config.display_name());
    println!("Hypervisor:  {}", config.virtualizer().name);
    if let Some(version) = config.virtualizer_version() {
        println!("Version:     {}", version);
    }
    println!(
        "Guest OS:    {}",
        config.os().map(|os| os.name.as_str()).unwrap_or("unknown")
    );
    println!("Snapshot:    {}", yes_no(config.is_machine_snapshot()));
    println!();

    if config.hdds().is_empty() {
        println!("Disks:       None");
    } else {
        println!("Disks:");
        for (i, disk) in config.hdds().iter().enumerate() {
            println!(
                "  {}. {} [{}{}]",
                i + 1,
                if disk.disk_image.is_empty() { "<empty>" } else { disk.disk_image.as_str() },
                disk.bus.as_str(),
                disk.chipset_driver
                    .as_deref()
                    .map(|d| format!(", {}", d))
                    .unwrap_or_default()
            );
        }
    }

    if !config.option_groups().is_empty() {
        println!();
        println!("Options:");
        for group in config.option_groups() {
            let ids: Vec<String> = group
                .options
                .iter()
                .map(|option| {
                    if option.active {
                        format!("*{}", option.id)
                    } else {
                        option.id.clone()
                    }
                })
                .collect();
            println!("  {:?}: {}", group.group, ids.join(" "));
        }
    }

    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Format bytes as human-readable string.
fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
