//! Internal domain modules for the Flashmark core library.
//!
//! All public types from these modules are re-exported at the crate root
//! with `#[doc(inline)]`; import from there in preference to this module.

pub mod codec;
pub mod collection;
pub mod config;
pub mod document;
pub mod error;
pub mod latex;
pub mod model;
pub mod note;
pub mod parser;
pub mod reconcile;
pub mod report;
pub mod storage;
pub mod sync;

#[doc(inline)]
pub use codec::{decode, encode, CodecOptions, LatexMode};
#[doc(inline)]
pub use collection::{Collection, CollectionTx, NoteStore};
#[doc(inline)]
pub use config::{DeckPolicy, SyncConfig, TagPolicy};
#[doc(inline)]
pub use error::{FlashmarkError, Result};
#[doc(inline)]
pub use latex::{LatexRenderer, LatexSnippet};
#[doc(inline)]
pub use model::{Model, ModelTable};
#[doc(inline)]
pub use note::{NoteBlock, NoteId, PersistedNote};
#[doc(inline)]
pub use parser::{parse, BlockDefaults};
#[doc(inline)]
pub use reconcile::{reconcile, Outcome, ReconciliationResult};
#[doc(inline)]
pub use report::{summarize, SyncReport};
#[doc(inline)]
pub use storage::Storage;
#[doc(inline)]
pub use sync::{sync_file, Synchronizer};
