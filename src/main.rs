use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use terratile::storage::{self, AddOptions, CreateMode, Direction, Location};
use terratile::tileset::{self, OpenMode};

#[derive(Parser, Debug)]
#[command(
    name = "terratile",
    about = "Tiled 3D terrain dataset storage management",
    version
)]
struct CliArgs {
    /// Enable verbose logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an empty storage
    CreateStorage {
        /// Storage root directory
        path: PathBuf,
        /// Reference frame id
        #[arg(long, default_value = "melown2015")]
        reference_frame: String,
        /// Replace an existing storage
        #[arg(long)]
        overwrite: bool,
    },
    /// Add a tileset to a storage
    Add {
        /// Storage root directory
        storage: PathBuf,
        /// Source tileset directory
        tileset: PathBuf,
        /// Id inside the storage (defaults to the tileset's own id)
        #[arg(long)]
        id: Option<String>,
        /// Put the tileset above this one (default: top of stack)
        #[arg(long, conflicts_with = "below")]
        above: Option<String>,
        /// Put the tileset below this one
        #[arg(long)]
        below: Option<String>,
        /// Derive a versioned id on collision
        #[arg(long)]
        bump_version: bool,
        /// Tags to attach
        #[arg(long)]
        tag: Vec<String>,
        /// Simulate only
        #[arg(long)]
        dry_run: bool,
    },
    /// Remove tilesets (and referencing glues) from a storage
    Remove {
        storage: PathBuf,
        /// Tileset ids to remove
        ids: Vec<String>,
    },
    /// List tilesets and glues of a storage
    List { storage: PathBuf },
    /// List glues that should exist but are not generated yet
    PendingGlues {
        storage: PathBuf,
        /// Limit to glues referencing this tileset
        #[arg(long)]
        tileset: Option<String>,
    },
    /// Generate one glue, identified by its member list in stack order
    GenerateGlue {
        storage: PathBuf,
        /// Member tileset ids, bottom of stack first
        members: Vec<String>,
        /// Overwrite an existing glue
        #[arg(long)]
        overwrite: bool,
    },
    /// Generate all pending glues referencing a tileset
    GenerateGlues {
        storage: PathBuf,
        tileset: String,
    },
    /// Register an aggregated read-only view over a subset of tilesets
    CreateVirtualSurface {
        storage: PathBuf,
        /// Member tileset ids in stack order
        members: Vec<String>,
        #[arg(long)]
        overwrite: bool,
    },
    /// Remove a registered virtual surface
    RemoveVirtualSurface {
        storage: PathBuf,
        members: Vec<String>,
    },
    /// Print the storage map configuration as JSON
    MapConfig { storage: PathBuf },
    /// Print information about a tileset
    Info { tileset: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("terratile=debug")
    } else {
        EnvFilter::new("terratile=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match args.command {
        Command::CreateStorage {
            path,
            reference_frame,
            overwrite,
        } => {
            let mode = if overwrite {
                CreateMode::Overwrite
            } else {
                CreateMode::FailIfExists
            };
            storage::create_storage(
                &path,
                &storage::StorageProperties::new(reference_frame),
                mode,
            )
            .context("cannot create storage")?;
            println!("Created storage at {}", path.display());
        }

        Command::Add {
            storage: storage_path,
            tileset,
            id,
            above,
            below,
            bump_version,
            tag,
            dry_run,
        } => {
            let mut storage = storage::open_storage(&storage_path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            let location = match (above, below) {
                (Some(anchor), _) => Location {
                    anchor: Some(anchor),
                    direction: Direction::Above,
                },
                (None, Some(anchor)) => Location {
                    anchor: Some(anchor),
                    direction: Direction::Below,
                },
                (None, None) => Location::top(),
            };
            let options = AddOptions {
                bump_version,
                tags: tag.into_iter().collect(),
                dry_run,
                ..AddOptions::default()
            };
            storage
                .add(&tileset, &location, id.as_deref(), &options)
                .context("cannot add tileset")?;

            let pending = storage.pending_glues(None).context("cannot list glues")?;
            println!("Added. Pending glues: {}", pending.len());
            for glue in pending {
                println!("  {}", glue.join(","));
            }
        }

        Command::Remove { storage: path, ids } => {
            let mut storage = storage::open_storage(&path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            storage.remove(&ids, None).context("cannot remove")?;
            println!("Removed {} tileset(s)", ids.len());
        }

        Command::List { storage: path } => {
            let storage = storage::open_storage(&path, OpenMode::ReadOnly)
                .context("cannot open storage")?;
            println!("Tilesets (bottom to top):");
            for stored in storage.stored_tilesets() {
                let tags: Vec<&str> = stored.tags.iter().map(|s| s.as_str()).collect();
                println!(
                    "  {} (base {}, version {}{})",
                    stored.tileset_id,
                    stored.base_id,
                    stored.version,
                    if tags.is_empty() {
                        String::new()
                    } else {
                        format!(", tags: {}", tags.join(" "))
                    }
                );
            }
            println!("Glues:");
            for id in storage.glues().keys() {
                println!("  {}", id.join(","));
            }
        }

        Command::PendingGlues {
            storage: path,
            tileset,
        } => {
            let storage = storage::open_storage(&path, OpenMode::ReadOnly)
                .context("cannot open storage")?;
            for glue in storage
                .pending_glues(tileset.as_deref())
                .context("cannot compute pending glues")?
            {
                println!("{}", glue.join(","));
            }
        }

        Command::GenerateGlue {
            storage: path,
            members,
            overwrite,
        } => {
            let mut storage = storage::open_storage(&path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            let options = AddOptions {
                overwrite,
                ..AddOptions::default()
            };
            storage
                .generate_glue(&members, &options)
                .context("cannot generate glue")?;
            println!("Generated glue {}", members.join(","));
        }

        Command::GenerateGlues {
            storage: path,
            tileset,
        } => {
            let mut storage = storage::open_storage(&path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            storage
                .generate_glues(&tileset, &AddOptions::default())
                .context("cannot generate glues")?;
            println!("Generated pending glues of {tileset}");
        }

        Command::CreateVirtualSurface {
            storage: path,
            members,
            overwrite,
        } => {
            let mut storage = storage::open_storage(&path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            let mode = if overwrite {
                CreateMode::Overwrite
            } else {
                CreateMode::FailIfExists
            };
            storage
                .create_virtual_surface(&members, mode, None)
                .context("cannot create virtual surface")?;
            println!("Created virtual surface {}", members.join(","));
        }

        Command::RemoveVirtualSurface {
            storage: path,
            members,
        } => {
            let mut storage = storage::open_storage(&path, OpenMode::ReadWrite)
                .context("cannot open storage")?;
            storage
                .remove_virtual_surface(&members, None)
                .context("cannot remove virtual surface")?;
            println!("Removed virtual surface {}", members.join(","));
        }

        Command::MapConfig { storage: path } => {
            let storage = storage::open_storage(&path, OpenMode::ReadOnly)
                .context("cannot open storage")?;
            let map_config = storage.map_config().context("cannot build map config")?;
            println!("{}", serde_json::to_string_pretty(&map_config)?);
        }

        Command::Info { tileset: path } => {
            let tileset =
                tileset::open_tile_set(&path, OpenMode::ReadOnly).context("cannot open tileset")?;
            let properties = tileset.properties();
            println!("Id:              {}", properties.id);
            println!("Reference frame: {}", properties.reference_frame);
            println!("Revision:        {}", properties.revision);
            println!("Lod range:       {}", properties.lod_range);
            if properties.tile_range.is_valid() {
                let (llx, lly) = properties.tile_range.ll;
                let (urx, ury) = properties.tile_range.ur;
                println!("Tile range:      ({llx}, {lly}) - ({urx}, {ury})");
            }
            let credits: BTreeSet<u16> = properties.credits.clone();
            if !credits.is_empty() {
                let list: Vec<String> = credits.iter().map(|c| c.to_string()).collect();
                println!("Credits:         {}", list.join(", "));
            }
        }
    }

    Ok(())
}
