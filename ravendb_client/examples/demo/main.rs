use ravendb_client::{events::RequestEvent, DocumentStoreBuilder};
use tracing::subscriber::set_global_default;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let scheme: String = std::env::var("RAVEN_SCHEME").unwrap_or_else(|_| "http".to_string());
    let database = std::env::var("RAVEN_DATABASE").unwrap_or_else(|_| "Northwind".to_string());
    let document_id =
        std::env::args().nth(1).unwrap_or_else(|| "employees/1-A".to_string());

    let mut document_store = DocumentStoreBuilder::new().set_database_name(&database);
    if scheme == "https" {
        document_store = document_store
            .set_client_certificate("ravendb-client_dev_cert.pem")
            .set_urls(&["https://a.free.damccull.ravendb.cloud"]);
    } else {
        document_store = document_store.set_urls(&["http://localhost:8080"]);
    }

    let document_store = document_store.build()?;

    // Report topology changes while the demo runs
    let request_executor = document_store.get_request_executor(None).await?;
    let mut events = request_executor.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let RequestEvent::TopologyUpdated { etag } = event {
                tracing::info!("Topology updated to etag {}", etag);
            }
        }
    });

    let session = document_store.open_session().await?;
    match session.load_json(&document_id).await {
        Ok(Some(document)) => println!("{:#}", document),
        Ok(None) => println!("`{}` does not exist", document_id),
        Err(e) => {
            tracing::error!("Error happened: {}", &e);
            return Err(e.into());
        }
    };

    println!(
        "Preferred node: {}",
        request_executor.preferred_node().await?.node.url
    );
    document_store.close().await?;

    Ok(())
}

fn setup_tracing() {
    // Redirect all `log`'s events to the subscriber
    LogTracer::init().expect("Failed to set logger");
    // Set up tracing
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let formatting_layer = BunyanFormattingLayer::new("ravendb-client-demo".into(), std::io::stdout);
    let subscriber = Registry::default()
        .with(env_filter)
        .with(JsonStorageLayer)
        .with(formatting_layer);
    set_global_default(subscriber).expect("Failed to set subscriber");
}
