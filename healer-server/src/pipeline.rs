//! Background execution of submitted runs.
//!
//! Each run gets its own blocking worker. The worker owns the run's
//! collaborators, updates the registry entry after every node and publishes
//! progress events to the hub.

use healer::core::types::RunState;
use healer::heal::{Collaborators, HealRequest, HealSettings, LiveCollaborators, run_healing};
use healer::io::run_record::write_run_record;
use healer::progress::ProgressEvent;
use tracing::{error, info, warn};

use crate::state::AppState;

/// Register `request` and start it on a blocking worker.
pub fn spawn_run(app: &AppState, request: HealRequest) {
    app.register(&request);
    let app = app.clone();
    tokio::task::spawn_blocking(move || {
        let settings = HealSettings::from_config(&app.config);
        // Blocking HTTP clients must be built and dropped off the async runtime.
        match LiveCollaborators::from_config(&app.config, &request.repo_url) {
            Ok(live) => execute_run(&app, &request, live.collaborators(), &settings),
            Err(err) => fail_run(&app, &request.initial_state(), &format!("{err:#}")),
        }
    });
}

/// Drive one run to completion, reporting through the registry and hub.
pub fn execute_run(
    app: &AppState,
    request: &HealRequest,
    tools: Collaborators<'_>,
    settings: &HealSettings,
) {
    let run_id = request.run_id.as_str();
    info!(run_id, repo = %request.repo_url, "run accepted");

    let result = run_healing(request, tools, settings, |node, _, state| {
        let event = ProgressEvent::update(node, state);
        app.update(run_id, |entry| entry.apply(&event, state));
        app.hub.publish(&event);
    });

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            fail_run(app, &request.initial_state(), &format!("{err:#}"));
            return;
        }
    };

    if let Err(err) = write_run_record(&settings.workspace_dir, &outcome.state) {
        warn!(run_id, err = %err, "failed to write run record");
    }
    // A fatal error still ends in a terminal state, but observers see an abort.
    let event = match outcome.state.fatal_error.as_deref() {
        Some(fatal) => ProgressEvent::error(&outcome.state, fatal),
        None => ProgressEvent::complete(&outcome.state),
    };
    app.update(run_id, |entry| entry.apply(&event, &outcome.state));
    let delivered = app.hub.publish(&event);
    info!(run_id, status = ?event.status, delivered, "run finished");
}

fn fail_run(app: &AppState, state: &RunState, message: &str) {
    error!(run_id = %state.run_id, err = %message, "run aborted");
    let event = ProgressEvent::error(state, message);
    app.update(&state.run_id, |entry| entry.apply(&event, state));
    app.hub.publish(&event);
}
