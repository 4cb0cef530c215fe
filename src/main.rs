use clap::{Parser, Subcommand};
use rszkit::{FormatOptions, RszFile, SchemaRegistry, TypeRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rsz", about = "Inspect and rewrite RSZ object-graph containers")]
struct Cli {
    /// Class layout dump (JSON keyed by hex type id)
    #[arg(short, long, global = true, default_value = "rsz.json")]
    schema: PathBuf,
    /// Type-database version; selects the userdata descriptor layout
    #[arg(long, global = true)]
    tdb_version: Option<u32>,
    /// Format options as JSON; --tdb-version overrides its tdb_version
    #[arg(long, global = true)]
    options: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show header fields, table sizes and read diagnostics
    Info {
        input: PathBuf,
    },
    /// List the root instances of the object table
    Roots {
        input: PathBuf,
    },
    /// Read, rebuild and write a container
    Repack {
        input:  PathBuf,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Repack in memory and check that every instance survives unchanged
    Verify {
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli      = Cli::parse();
    let options  = load_options(cli.options.as_deref(), cli.tdb_version)?;
    let registry: Arc<dyn TypeRegistry> = Arc::new(SchemaRegistry::from_path(&cli.schema)?);

    match cli.command {

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let file = RszFile::open(&input, options, registry)?;
            let hd   = &file.header;
            println!("── RSZ container ────────────────────────────────────────");
            println!("  Path             {}", input.display());
            println!("  Version          {}", hd.version);
            println!("  Objects          {}", hd.object_count);
            println!("  Instances        {} ({} decoded)", hd.instance_count, file.instance_count());
            println!("  Userdata         {} ({:?})", hd.userdata_count, file.userdata_infos.shape());
            println!("  Embedded files   {}", file.embedded_files.len());
            println!("  Instance offset  {:#x}", hd.instance_offset);
            println!("  Userdata offset  {:#x}", hd.userdata_offset);
            println!("  Data offset      {:#x}", hd.data_offset);
            if !file.diagnostics.is_empty() {
                println!("  Diagnostics ({}):", file.diagnostics.len());
                for d in &file.diagnostics {
                    println!("    {d}");
                }
            }
        }

        // ── Roots ────────────────────────────────────────────────────────────
        Commands::Roots { input } => {
            let file = RszFile::open(&input, options, registry)?;
            println!("{:<6} {:>6}  Class", "Root", "Index");
            for (i, &index) in file.object_table.iter().enumerate() {
                let class = file.root(i)
                    .map(|id| file[id].class_name().to_owned())
                    .unwrap_or_else(|| "<unresolved>".into());
                println!("{:<6} {:>6}  {}", i, index, class);
            }
        }

        // ── Repack ───────────────────────────────────────────────────────────
        Commands::Repack { input, output } => {
            let mut file = RszFile::open(&input, options, registry)?;
            file.unflatten_all()?;
            file.rebuild_descriptors(true)?;
            let size = file.save(&output)?;
            println!("Repacked {} instance(s), {} B → {}", file.instance_count(), size, output.display());
        }

        // ── Verify ───────────────────────────────────────────────────────────
        Commands::Verify { input } => {
            let mut file = RszFile::open(&input, options, registry.clone())?;
            let before: Vec<_> = file.instances().iter().map(|&id| file[id].values.clone()).collect();
            file.unflatten_all()?;
            file.rebuild_descriptors(true)?;
            let bytes = file.to_bytes()?;
            let back  = RszFile::from_bytes(options, registry, &bytes)?;

            let mut mismatches = 0usize;
            if back.instance_count() != before.len() {
                println!("instance count changed: {} → {}", before.len(), back.instance_count());
                mismatches += 1;
            }
            for (position, (&id, values)) in back.instances().iter().zip(&before).enumerate() {
                if &back[id].values != values {
                    println!("instance {} ({}) differs after repack", position, back[id].class_name());
                    mismatches += 1;
                }
            }
            if mismatches > 0 {
                return Err(format!("{mismatches} mismatch(es) in {}", input.display()).into());
            }
            println!("OK: {} instance(s), {} B", back.instance_count(), bytes.len());
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn load_options(path: Option<&Path>, tdb_version: Option<u32>) -> Result<FormatOptions, Box<dyn std::error::Error>> {
    let mut options = match path {
        Some(path) => FormatOptions::from_path(path)?,
        None       => FormatOptions::default(),
    };
    if let Some(tdb) = tdb_version {
        options.tdb_version = tdb;
    }
    Ok(options)
}
