mod contexts;
mod handle;
pub mod messaging;
mod sync;

pub use contexts::{BackgroundContext, PageContext, SettingsContext, SettingsEntry};
pub use handle::StopHandle;
pub use sync::SyncContext;
