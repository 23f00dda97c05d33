use bulletin::configuration::get_configuration;
use bulletin::scheduler::Signal;
use bulletin::startup::Application;
use bulletin::telemetry::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = get_subscriber("bulletin".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    let configuration = get_configuration().expect("Failed to read configuration.");
    let application = Application::build(configuration).await?;
    tracing::info!(port = application.port(), "Listening");

    let shutdown = application.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutting down");
            let _ = shutdown.send(Signal::Shutdown);
        }
    });

    application.run_until_stopped().await?;
    Ok(())
}
