use std::time::{SystemTime, UNIX_EPOCH};

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    dashmap::DashMap,
    qrcode::{QrCode, render::svg},
    serde::Serialize,
    tracing::debug,
};

use crate::{
    branch::BranchId,
    error::{Error, Result},
};

/// The latest pairing code emitted for a branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairingCode {
    /// Payload exactly as the transport emitted it.
    pub raw: String,
    /// Scannable rendering: an SVG QR code as a `data:` URL.
    pub encoded: String,
    /// Milliseconds since the Unix epoch.
    pub issued_at: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Render a pairing payload as an SVG QR code wrapped in a `data:` URL.
pub fn encode_qr_data_url(raw: &str) -> Result<String> {
    let code = QrCode::new(raw.as_bytes()).map_err(|e| Error::PairingEncode(e.to_string()))?;
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build();
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        STANDARD.encode(image.as_bytes())
    ))
}

/// Most recent pairing code per branch. Entries live until overwritten or
/// cleared; there is no expiry.
#[derive(Debug, Default)]
pub struct PairingCodeCache {
    codes: DashMap<BranchId, PairingCode>,
}

impl PairingCodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode and store `raw`, replacing any previous code.
    pub fn set(&self, branch: &BranchId, raw: &str) -> Result<PairingCode> {
        let code = PairingCode {
            raw: raw.to_string(),
            encoded: encode_qr_data_url(raw)?,
            issued_at: now_ms(),
        };
        self.codes.insert(branch.clone(), code.clone());
        debug!(branch = %branch, "pairing code cached");
        Ok(code)
    }

    pub fn get(&self, branch: &BranchId) -> Option<PairingCode> {
        self.codes.get(branch).map(|c| c.clone())
    }

    pub fn clear(&self, branch: &BranchId) {
        if self.codes.remove(branch).is_some() {
            debug!(branch = %branch, "pairing code cleared");
        }
    }

    pub fn contains(&self, branch: &BranchId) -> bool {
        self.codes.contains_key(branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branch(id: &str) -> BranchId {
        BranchId::new(id).unwrap()
    }

    #[test]
    fn encodes_as_svg_data_url() {
        let url = encode_qr_data_url("ABC123").unwrap();
        let payload = url.strip_prefix("data:image/svg+xml;base64,").unwrap();
        let svg = String::from_utf8(STANDARD.decode(payload).unwrap()).unwrap();
        assert!(svg.contains("<svg"));
    }

    #[test]
    fn set_overwrites_previous_code() {
        let cache = PairingCodeCache::new();
        let b = branch("5");

        cache.set(&b, "first").unwrap();
        cache.set(&b, "second").unwrap();

        let code = cache.get(&b).unwrap();
        assert_eq!(code.raw, "second");
        assert_eq!(code.encoded, encode_qr_data_url("second").unwrap());
        assert!(code.issued_at > 0);
    }

    #[test]
    fn clear_is_per_branch() {
        let cache = PairingCodeCache::new();
        cache.set(&branch("5"), "a").unwrap();
        cache.set(&branch("6"), "b").unwrap();

        cache.clear(&branch("5"));
        assert!(cache.get(&branch("5")).is_none());
        assert!(cache.contains(&branch("6")));
    }
}
