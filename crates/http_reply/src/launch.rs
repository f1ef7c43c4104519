// Wires a typed configuration into a ready-to-serve replay server.

use crate::{
    activity::ActivityLog,
    config::ReplayConfig,
    errors::StartupError,
    sequencer::Sequencer,
    server::{self, BoundServer},
    store::TestCaseStore,
};

/// Loads the test cases described by `config` and binds the listener.
///
/// The store is loaded first: a missing or empty source fails here without
/// the listening port ever being touched.
pub async fn launch(
    config: &ReplayConfig,
    activity: ActivityLog,
) -> Result<BoundServer, StartupError> {
    let selection = config.selection.selection();
    let store = TestCaseStore::load_configured(&config.source, selection)?;

    reply_trace::info!(
        "Loaded {} test cases from {} ({})",
        store.len(),
        store.origin(),
        selection
    );

    let sequencer = Sequencer::shared(store, config.dispatch.mode);
    let server = server::bind(config.server_settings(), sequencer, activity).await?;

    Ok(server)
}
