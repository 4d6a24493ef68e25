//! Ossature – typed entity schemas over a transactional key-value store.
//!
//! An application describes each kind of entity as a *skeleton*: an ordered
//! set of typed fields called *bones*. The persistence engine flattens the
//! bones into a schemaless property bag and keeps a few invariants intact on
//! every write:
//! * Values of a bone marked unique are claimed through lock records, so two
//!   entities never hold the same value, even under concurrent writes.
//! * Uploaded blobs referenced by an entity are tracked in a blob lock record;
//!   references that are dropped move to an "old" set for garbage collection.
//! * Relational bones copy data of the entities they point to and leave a
//!   relation record behind. When the destination changes, a deferred task
//!   finds those records and refreshes every dependent entity.
//!
//! ## Modules
//! * [`datatype`] – [`datatype::Value`], [`datatype::Key`] and the
//!   [`datatype::Entity`] property bag.
//! * [`persist`] – the SQLite backed [`persist::Datastore`], queries and cursors.
//! * [`bones`] – the [`bones::Bone`] trait and the provided bones.
//! * [`skeleton`] / [`relskel`] – definitions and instances.
//! * [`registry`] – kind name to definition lookup with override rules.
//! * [`engine`] – [`engine::Database`]: load, save, delete, list.
//! * [`tasks`] – relation propagation and search index rebuilds.
//! * [`render`] – JSON and XML output.
//!
//! ## Quick Start
//! ```
//! use ossature::bones::{Configure, StringBone};
//! use ossature::engine::Database;
//! use ossature::persist::PersistenceMode;
//! use ossature::skeleton::SkeletonBuilder;
//!
//! let person = SkeletonBuilder::new("person")
//!     .bone("name", StringBone::new("Name").required())
//!     .build()
//!     .unwrap();
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let mut skel = person.instance();
//! skel.set_value("name", "Alice").unwrap();
//! let key = db.save(&mut skel, false).unwrap();
//!
//! let mut again = person.instance();
//! assert!(db.load(&mut again, &key).unwrap());
//! assert_eq!(again.value("name").and_then(|v| v.as_text()), Some("Alice"));
//! ```

pub mod bones;
pub mod config;
pub mod datatype;
pub mod engine;
pub mod error;
pub mod locks;
pub mod persist;
pub mod registry;
pub mod relskel;
pub mod render;
pub mod search;
pub mod skeleton;
pub mod skellist;
pub mod tasks;

pub use engine::Database;
pub use error::{OssatureError, Result};
pub use skeleton::{Skeleton, SkeletonBuilder, SkeletonDefinition};
