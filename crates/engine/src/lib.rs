// studio-collab-engine: collaborative session engine for the page editor.
//
// Sessions, presence and the edit log live in a shared SQLite database so
// that any number of stateless request handlers (threads or processes) can
// serve the same session. All ordering guarantees come from conditional
// updates inside immediate transactions, never from in-process locks.

pub mod clock;
pub mod content;
pub mod coordinator;
pub mod error;
pub mod policy;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use content::{ContentStore, ContentStoreError, FsContentStore, MemoryContentStore};
pub use coordinator::SessionCoordinator;
pub use error::{CollabError, CollabResult};
pub use policy::{RetentionPolicy, SweepCutoffs};
