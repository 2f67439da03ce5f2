use events::{Identity, IdentityParseError};
use log::*;
use service::{config::Config, logging::Logger};
use sync::{BindOptions, Manager, Options, SyncClient};

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    let identities = match parse_watch_list(&config.watch) {
        Ok(identities) => identities,
        Err(e) => {
            error!("Invalid watch list: {e}");
            std::process::exit(1);
        }
    };

    info!(
        "Starting HomeCon sync monitor [{}] for {} identities...",
        config.backend_url(),
        identities.len()
    );

    let manager = Manager::init(Options::from_config(&config));

    let mut watchers = Vec::new();
    for identity in identities {
        match manager.bind(identity.clone(), BindOptions::default()).await {
            Ok(client) => watchers.push(tokio::spawn(watch(client))),
            Err(e) => error!("Failed to bind {identity}: {e}"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }

    info!("Shutting down sync monitor...");
    for watcher in watchers {
        watcher.abort();
        let _ = watcher.await;
    }
    manager.shutdown().await;
}

async fn watch(mut client: SyncClient) {
    let identity = client.identity().clone();
    if let Some(value) = client.value() {
        info!("{identity} = {value} (cached)");
    }

    loop {
        match client.changed().await {
            Ok(value) => info!("{identity} = {value}"),
            Err(e) => {
                debug!("Stopped watching {identity}: {e}");
                break;
            }
        }
    }
}

/// Parses `event` / `event:key` entries, skipping blanks and duplicates.
fn parse_watch_list(entries: &[String]) -> Result<Vec<Identity>, IdentityParseError> {
    let mut identities: Vec<Identity> = Vec::new();
    for entry in entries.iter().map(|entry| entry.trim()).filter(|entry| !entry.is_empty()) {
        let identity: Identity = entry.parse()?;
        if !identities.contains(&identity) {
            identities.push(identity);
        }
    }
    Ok(identities)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|entry| entry.to_string()).collect()
    }

    #[test]
    fn test_watch_list_parses_keys() {
        let identities = parse_watch_list(&entries(&["state_list", "state:7", " state_children:3 "])).unwrap();
        assert_eq!(
            identities,
            vec![
                Identity::state_list(),
                Identity::state(7),
                Identity::state_children(3_i64),
            ]
        );
    }

    #[test]
    fn test_watch_list_skips_blanks_and_duplicates() {
        let identities = parse_watch_list(&entries(&["state:7", "", "state:7"])).unwrap();
        assert_eq!(identities, vec![Identity::state(7)]);
    }
}
