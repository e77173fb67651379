pub mod dispatch;
pub mod editor;
pub mod gradio;
pub mod session;
pub mod transport;

use std::sync::Arc;

use anyhow::Result;
use magicfx_contracts::settings::Settings;

pub use dispatch::{
    build_arguments, extract_result, DispatchError, Dispatcher, GenerationInput,
    GenerationResult, InputError,
};
pub use editor::{EditorView, RunBlocker, RunError};
pub use gradio::GradioTransport;
pub use session::{
    Invoke, SessionError, SessionManager, SessionSnapshot, SessionState, StatusSchedule,
};
pub use transport::{Argument, DryrunTransport, RemoteConnection, RemoteTransport};

/// Picks the transport for this process: local answers for `dryrun`,
/// otherwise the Gradio HTTP client configured from `settings`.
pub fn transport_for(settings: &Settings, dryrun: bool) -> Result<Arc<dyn RemoteTransport>> {
    if dryrun {
        return Ok(Arc::new(DryrunTransport::new()));
    }
    Ok(Arc::new(GradioTransport::new(settings)?))
}
