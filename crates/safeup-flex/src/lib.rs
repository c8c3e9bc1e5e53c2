mod directory;
mod index;
mod index_file;
mod object;
mod storage;

pub use directory::{LookupField, UserDirectory, USER_INDEX_VERSION};
pub use index::{
    sync_index, ChangeSink, FlexIndex, IndexChanges, IndexEntry, IndexMeta, KeyField, PlainMeta,
    SyncOptions, TracingChangeSink, UserMeta,
};
pub use index_file::{CompiledIndex, IndexFile};
pub use object::FlexObject;
pub use storage::{DataFormat, FileStorage, FlexStorage, FolderStorage, KeyNormalizer, StorageEntry};
