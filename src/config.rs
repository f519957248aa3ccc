/// Default production relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "wss://relay.zoomish.app/ws";

#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub relay_url: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
        }
    }
}
