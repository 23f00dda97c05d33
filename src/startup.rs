use std::sync::Arc;

use anyhow::Context;
use axum::extract::{FromRef, MatchedPath};
use axum::http::Request;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::authentication::{require_admin, AdminCredentials};
use crate::channel::{DeliveryChannel, HttpRelay, SmtpRelay};
use crate::configuration::{RelayKind, Settings};
use crate::dispatcher::{Composer, Dispatcher};
use crate::routes::{
    check_health, check_relay, create_newsletter, create_subscriber, delete_newsletter,
    delete_subscriber, duplicate_newsletter, edit_newsletter, edit_subscriber, export_subscribers,
    get_newsletter, get_statistics, import_subscribers, list_deliveries, list_newsletters,
    list_subscribers, preview_newsletter, requeue_newsletter, schedule_newsletter,
    send_newsletter, send_test_newsletter, unschedule_newsletter, unsubscribe,
};
use crate::scheduler::{Scheduler, Signal};
use crate::store::{InMemoryStore, PostgresStore, Store};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Dispatcher,
}

impl FromRef<AppState> for Arc<dyn Store> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for Dispatcher {
    fn from_ref(state: &AppState) -> Self {
        state.dispatcher.clone()
    }
}

pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    scheduler: Option<Scheduler>,
    shutdown: broadcast::Sender<Signal>,
}

impl Application {
    /// Wires the configured store and relay into a running application.
    pub async fn build(configuration: Settings) -> Result<Self, anyhow::Error> {
        let store: Arc<dyn Store> = if configuration.database.in_memory {
            tracing::warn!("Using the in-memory store, nothing survives a restart");
            Arc::new(InMemoryStore::new())
        } else {
            let store = PostgresStore::connect_lazy(&configuration.database)
                .context("Failed to configure the Postgres pool")?;
            store
                .migrate()
                .await
                .context("Failed to migrate the database")?;
            Arc::new(store)
        };

        let channel: Arc<dyn DeliveryChannel> = match configuration.relay.kind {
            RelayKind::Smtp => Arc::new(SmtpRelay::new(&configuration.relay)?),
            RelayKind::Http => Arc::new(HttpRelay::new(&configuration.relay)?),
        };

        Self::build_with(configuration, store, channel).await
    }

    /// Same as [`Application::build`] with the store and relay supplied by the caller.
    pub async fn build_with(
        configuration: Settings,
        store: Arc<dyn Store>,
        channel: Arc<dyn DeliveryChannel>,
    ) -> Result<Self, anyhow::Error> {
        let composer = Composer::new(&configuration.relay, &configuration.dispatch)
            .map_err(anyhow::Error::msg)
            .context("Invalid sender or operator address")?;
        let dispatcher = Dispatcher::new(
            store.clone(),
            channel,
            composer,
            configuration.relay.timeout(),
        );

        let scheduler = configuration
            .scheduler
            .enabled
            .then(|| Scheduler::new(dispatcher.clone(), &configuration.scheduler));

        let admin = AdminCredentials::new(&configuration.admin);
        let router = router(AppState { store, dispatcher }, admin);

        let listener = TcpListener::bind(format!(
            "{}:{}",
            configuration.application.host, configuration.application.port
        ))
        .await
        .context("Failed to bind a port for the application")?;
        let port = listener.local_addr()?.port();
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            port,
            listener,
            router,
            scheduler,
            shutdown,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Sender that stops the scheduler and the server.
    pub fn shutdown_handle(&self) -> broadcast::Sender<Signal> {
        self.shutdown.clone()
    }

    pub async fn run_until_stopped(self) -> Result<(), std::io::Error> {
        let scheduler = self.scheduler.map(|scheduler| {
            let receiver = self.shutdown.subscribe();
            tokio::spawn(scheduler.run(receiver))
        });

        let mut server_shutdown = self.shutdown.subscribe();
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await?;

        join_scheduler(scheduler).await;
        Ok(())
    }
}

async fn join_scheduler(scheduler: Option<JoinHandle<()>>) {
    if let Some(handle) = scheduler {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "The scheduler task failed");
        }
    }
}

pub fn router(state: AppState, admin: AdminCredentials) -> Router {
    let admin_routes = Router::new()
        .route("/newsletters", get(list_newsletters).post(create_newsletter))
        .route(
            "/newsletters/:id",
            get(get_newsletter)
                .put(edit_newsletter)
                .delete(delete_newsletter),
        )
        .route("/newsletters/:id/duplicate", post(duplicate_newsletter))
        .route("/newsletters/:id/preview", get(preview_newsletter))
        .route("/newsletters/:id/schedule", post(schedule_newsletter))
        .route("/newsletters/:id/unschedule", post(unschedule_newsletter))
        .route("/newsletters/:id/send", post(send_newsletter))
        .route("/newsletters/:id/test", post(send_test_newsletter))
        .route("/newsletters/:id/requeue", post(requeue_newsletter))
        .route("/newsletters/:id/deliveries", get(list_deliveries))
        .route("/subscribers", get(list_subscribers).post(create_subscriber))
        .route("/subscribers/import", post(import_subscribers))
        .route("/subscribers/export", get(export_subscribers))
        .route(
            "/subscribers/:id",
            axum::routing::put(edit_subscriber).delete(delete_subscriber),
        )
        .route("/statistics", get(get_statistics))
        .route("/relay/check", post(check_relay))
        .layer(from_fn_with_state(admin, require_admin));

    Router::new()
        .route("/health_check", get(check_health))
        .route("/unsubscribe/:token", get(unsubscribe))
        .nest("/admin", admin_routes)
        .with_state(state)
        .layer(
            // Refer to https://github.com/tokio-rs/axum/blob/main/examples/tracing-aka-logging/Cargo.toml
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                let path = request
                    .extensions()
                    .get::<MatchedPath>()
                    .map(MatchedPath::as_str);
                tracing::info_span!(
                    "Starting HTTP request",
                    method = ?request.method(),
                    path,
                    request_id = %Uuid::new_v4(),
                )
            }),
        )
}
