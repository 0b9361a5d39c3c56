//! Memory: the per-process conversation buffer and the knowledge base index.
//!
//! ```text
//! {knowledge.store_dir}/
//! └── chunks.db      documents + FTS5 chunk index
//! ```

pub mod conversation;
pub mod knowledge;

pub use conversation::{ConversationMemory, EntityContext, HistoryEntry};
pub use knowledge::{BuildReport, Document, KnowledgeStore, SearchResult, StoreStats};
