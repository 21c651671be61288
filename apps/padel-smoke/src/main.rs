mod config;
mod logging;

use std::{env, process::ExitCode, sync::Arc};

use config::SmokeConfig;
use padel_core::{AsyncDataController, ControllerOptions};
use padel_platform::{AppContext, Capabilities, TracingAnalyticsSink, TracingErrorReporter};
use padel_supabase::{
    AuthClient, NotificationAggregator, NotificationTables, PhoenixRealtimeBus, ProjectEndpoint,
    RequestExecutor, ReqwestTransport, SessionStore, SupabaseNotificationSource, aggregate,
};
use serde_json::json;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    logging::init();

    let config = match SmokeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "smoke run failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: SmokeConfig) -> Result<(), Box<dyn std::error::Error>> {
    let context = AppContext::new(
        Capabilities::detect(|key| env::var(key).ok()),
        Arc::new(TracingErrorReporter),
        Arc::new(TracingAnalyticsSink),
    );
    context.analytics().init();
    info!(platform = %context.capabilities().platform, "starting smoke run");

    let endpoint = ProjectEndpoint::new(config.supabase_url.as_str(), config.anon_key.clone())?;
    let session = SessionStore::new();
    let executor = Arc::new(
        RequestExecutor::new(
            endpoint.clone(),
            Arc::new(ReqwestTransport::new()?),
            session.clone(),
        )
        .with_reporter(context.reporter())
        .with_connectivity(context.connectivity().clone())
        .with_request_timeout(config.tuning.request_timeout()),
    );

    let Some(credentials) = config.credentials else {
        info!("PADEL_EMAIL and PADEL_PASSWORD not set; skipping live notification run");
        return Ok(());
    };

    let auth = AuthClient::new(Arc::clone(&executor));
    let signed_in = auth
        .sign_in_with_password(&credentials.email, &credentials.password)
        .await?;
    let user_id = signed_in.user.id.clone();
    context.analytics().identify(user_id.clone());
    if let Err(err) = context
        .analytics()
        .track("smoke_signed_in", json!({ "email": credentials.email }))
    {
        warn!(error = %err, "analytics event dropped");
    }

    let source = Arc::new(SupabaseNotificationSource::new(
        Arc::clone(&executor),
        NotificationTables::default(),
    ));

    let initial = {
        let source = Arc::clone(&source);
        AsyncDataController::spawn(
            move |user_id: String| {
                let source = Arc::clone(&source);
                async move { aggregate(source.as_ref(), &user_id).await }
            },
            user_id.clone(),
            ControllerOptions::from(&config.tuning),
        )
    };
    let settled = initial
        .subscribe()
        .wait_for(|state| state.is_settled())
        .await
        .map(|state| state.clone())?;
    match (settled.data, settled.error) {
        (Some(counts), _) => info!(
            incoming = counts.incoming_challenges(),
            scheduled = counts.scheduled_matches(),
            approvals = counts.ladder_approvals(),
            total = counts.total(),
            "initial notification counts"
        ),
        (None, Some(err)) => warn!(code = err.code.as_str(), error = %err, "initial load failed"),
        (None, None) => {}
    }

    let bus = Arc::new(PhoenixRealtimeBus::new(&endpoint, session.clone()));
    let aggregator = NotificationAggregator::spawn(
        source,
        bus,
        session.subscribe(),
        config.tuning.notification_debounce(),
    );
    let mut counts = aggregator.subscribe();
    info!(user_id = %user_id, "watching notification counts; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            changed = counts.changed() => {
                if changed.is_err() {
                    warn!("notification aggregator stopped unexpectedly");
                    break;
                }
                let current = *counts.borrow_and_update();
                info!(
                    incoming = current.incoming_challenges(),
                    scheduled = current.scheduled_matches(),
                    approvals = current.ladder_approvals(),
                    total = current.total(),
                    "notification counts updated"
                );
            }
        }
    }

    aggregator.shutdown().await;
    if let Err(err) = auth.sign_out().await {
        warn!(error = %err, "remote sign-out failed");
    }
    context.analytics().reset();
    info!("smoke run finished");
    Ok(())
}
