//! Persistent nearest-neighbour index over fixed-dimension embeddings.
//!
//! Vectors and their document records live in two files inside one directory:
//! a binary `index.bin` and a JSON `documents.json`. Both are replaced through
//! write-to-temp-then-rename, documents first, so an interrupted write leaves at
//! worst extra trailing document records that are dropped on the next load.

mod error;
mod index;
mod persist;

pub use error::{IndexError, Result};
pub use index::{
    similarity_from_distance, ChunkMetadata, Embedding, IndexedDocument, SearchHit, VectorIndex,
};
pub use persist::{DOCUMENTS_FILE, INDEX_FILE};
