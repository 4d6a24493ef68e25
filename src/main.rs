//! Maintenance tool for an ossature datastore.
//!
//! Inspects what the persistence engine leaves behind: entity kinds, single
//! entities, blob locks awaiting garbage collection and relation records.

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ossature::bones::RELATIONS_KIND;
use ossature::config::Settings;
use ossature::datatype::{Entity, Key, Value};
use ossature::error::Result;
use ossature::locks::{BlobLock, BLOB_LOCKS_KIND};
use ossature::persist::{Cursor, Datastore, FilterOp, Query, Store};

const PAGE: usize = 200;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file, without extension
    #[arg(short, long, default_value = "config/ossature")]
    config: String,

    /// SQLite file, overrides the configured database path
    #[arg(short, long)]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the kinds present in the datastore with their entity counts
    Kinds {},
    /// Print one entity as JSON
    Inspect {
        /// Encoded key of the entity
        key: String,
    },
    /// List blob lock records holding old references
    BlobLocks {
        /// Only records whose entity has been deleted
        #[arg(long)]
        stale: bool,
    },
    /// List relation records pointing at an entity
    Relations {
        /// Encoded key of the referenced entity
        dest: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::from_file(&cli.config)?;
    if let Some(path) = cli.database {
        settings.database.path = Some(path);
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store = Datastore::new(settings.persistence_mode())?;
    info!(mode = ?store.mode(), "datastore opened");
    match cli.command {
        Commands::Kinds {} => {
            for (kind, count) in store.kinds()? {
                println!("{:<40} {}", kind, count);
            }
        }
        Commands::Inspect { key } => {
            let key = Key::decode(&key)?;
            match store.get(&key)? {
                Some(entity) => println!("{}", serde_json::to_string_pretty(&entity_json(&entity))?),
                None => println!("{} does not exist", key),
            }
        }
        Commands::BlobLocks { stale } => {
            let mut query = Query::new(BLOB_LOCKS_KIND).filter("has_old_blob_references", FilterOp::Eq, true);
            if stale {
                query = query.filter("is_stale", FilterOp::Eq, true);
            }
            for entity in all(&store, &query)? {
                let lock = BlobLock::from_entity(&entity)?;
                let old: Vec<&str> = lock.old.iter().map(String::as_str).collect();
                println!("{} stale={} old=[{}]", lock.key, lock.is_stale, old.join(", "));
            }
        }
        Commands::Relations { dest } => {
            let dest = Key::decode(&dest)?;
            let query = Query::new(RELATIONS_KIND).filter("dest.key", FilterOp::Eq, dest.encode());
            for record in all(&store, &query)? {
                let source = record.key().and_then(Key::parent).map(Key::encode).unwrap_or_default();
                let property = record.get("viur_src_property").map(Value::to_string).unwrap_or_default();
                let tag = record.get("viur_delayed_update_tag").map(Value::to_string).unwrap_or_default();
                println!("{} {} {}", source, property, tag);
            }
        }
    }
    Ok(())
}

fn all(store: &Datastore, query: &Query) -> Result<Vec<Entity>> {
    let mut entities = Vec::new();
    let mut cursor: Option<Cursor> = None;
    loop {
        let batch = store.run_query(query, PAGE, cursor.as_ref())?;
        entities.extend(batch.entities);
        if !batch.more {
            return Ok(entities);
        }
        cursor = batch.cursor;
    }
}

fn entity_json(entity: &Entity) -> serde_json::Value {
    serde_json::json!({
        "key": entity.key().map(Key::encode),
        "kind": entity.kind(),
        "properties": entity
            .properties()
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect::<serde_json::Map<_, _>>(),
        "unindexed": entity.unindexed(),
    })
}
