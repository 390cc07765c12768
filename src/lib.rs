// ddm-store - derived state for declarative device management

pub mod builder;
pub mod config;
pub mod declaration;
pub mod error;
pub mod graph;
pub mod invalidation;
pub mod kv;
pub mod status;
pub mod store;

pub use builder::{BuildSession, DeclarationItemsBuilder, DerivedDocuments, DocumentBuilder};
pub use config::{SaltSource, StoreConfig, TokenHash};
pub use declaration::Declaration;
pub use error::{CascadeFailure, EntityKind, StoreError};
pub use kv::{FileKv, KvError, KvStore, MemoryKv, Record};
pub use status::{Page, StatusReport};
pub use store::{DdmStore, StoreOutcome};
