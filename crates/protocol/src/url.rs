use crate::error::ProtocolError;

/// Client identity fields folded into the signaling URL's query string.
/// On the original firmware these came from `esp_chip_info`/`esp_get_idf_version`;
/// board-specific initialization is out of scope here, so the caller supplies them.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub sdk: String,
    pub version: String,
    pub os: String,
    pub os_version: String,
    pub device_model: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            sdk: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            os_version: String::new(),
            device_model: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Builds the signaling URL. `access_token` is always the last query
/// parameter so `redact` can drop it (and everything after it) cleanly.
pub fn build_url(server_url: &str, token: &str, info: &ClientInfo) -> Result<String, ProtocolError> {
    if server_url.is_empty() {
        return Err(ProtocolError::InvalidUrl("server url must not be empty"));
    }
    if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        return Err(ProtocolError::InvalidUrl(
            "server url must use the ws:// or wss:// scheme",
        ));
    }

    let separator = if server_url.ends_with('/') { "" } else { "/" };

    Ok(format!(
        "{server_url}{separator}rtc?sdk={sdk}&version={version}&os={os}&os_version={os_version}&device_model={device_model}&auto_subscribe=false&access_token={token}",
        sdk = info.sdk,
        version = info.version,
        os = info.os,
        os_version = info.os_version,
        device_model = info.device_model,
    ))
}

/// Returns `url` with everything from `access_token=` onward replaced by
/// `[REDACTED]`, for log call sites. Never used for the value handed to the
/// WebSocket client itself.
pub fn redact(url: &str) -> String {
    match url.find("access_token=") {
        Some(idx) => format!("{}[REDACTED]", &url[..idx + "access_token=".len()]),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> ClientInfo {
        ClientInfo {
            sdk: "rust".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            os_version: "6.6".into(),
            device_model: "x86_64".into(),
        }
    }

    #[test]
    fn token_is_last_query_parameter() {
        let url = build_url("wss://example.com", "secret-token", &info()).unwrap();
        assert!(url.ends_with("access_token=secret-token"));
    }

    #[test]
    fn inserts_slash_when_missing() {
        let url = build_url("wss://example.com", "t", &info()).unwrap();
        assert!(url.contains("example.com/rtc?"));
    }

    #[test]
    fn no_doubled_slash_when_present() {
        let url = build_url("wss://example.com/", "t", &info()).unwrap();
        assert!(url.contains("example.com/rtc?"));
        assert!(!url.contains("//rtc?"));
    }

    #[test]
    fn rejects_http_scheme() {
        let err = build_url("http://example.com", "t", &info()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUrl(_)));
    }

    #[test]
    fn rejects_empty_server_url() {
        let err = build_url("", "t", &info()).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUrl(_)));
    }

    #[test]
    fn redaction_hides_token_and_nothing_else() {
        let url = build_url("wss://example.com", "super-secret", &info()).unwrap();
        let redacted = redact(&url);
        assert!(!redacted.contains("super-secret"));
        assert!(redacted.contains("sdk=rust"));
        assert!(redacted.ends_with("access_token=[REDACTED]"));
    }

    #[test]
    fn redact_is_noop_without_token_param() {
        let url = "wss://example.com/rtc?sdk=rust";
        assert_eq!(redact(url), url);
    }
}
