//! Screenshot capture and upload. The capture side calls the CDP session
//! directly; the upload side is treated, per the specification, as a single
//! opaque HTTP POST, so no particular response shape is assumed.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::json;

use crate::cdp::CdpSession;
use crate::config::AutomationConfig;
use crate::Result;

/// Captures a screenshot of the current page via `Page.captureScreenshot`
/// and, if a screenshot endpoint is configured, uploads it.
pub async fn capture_and_upload(
    session: &CdpSession,
    config: &AutomationConfig,
    http: &reqwest::Client,
) -> Result<()> {
    if !config.should_take_screenshot() {
        return Ok(());
    }
    let bytes = capture(session, &config.screenshot_format).await?;
    upload(http, config, bytes).await
}

/// Takes a screenshot and returns the raw image bytes.
pub async fn capture(session: &CdpSession, format: &str) -> Result<Vec<u8>> {
    let result = session
        .send(
            "Page.captureScreenshot",
            Some(json!({ "format": format })),
        )
        .await?;
    let data = result
        .get("data")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    Ok(BASE64.decode(data).unwrap_or_default())
}

async fn upload(http: &reqwest::Client, config: &AutomationConfig, bytes: Vec<u8>) -> Result<()> {
    let endpoint = match &config.screenshot_api_url {
        Some(url) => url,
        None => return Ok(()),
    };
    let mut request = http.post(endpoint).body(bytes);
    if let Some(target) = &config.screenshot_target_uri {
        request = request.query(&[("target", target.as_str())]);
    }
    request.send().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip_for_capture_decoding() {
        let original = b"fake png bytes";
        let encoded = BASE64.encode(original);
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }
}
