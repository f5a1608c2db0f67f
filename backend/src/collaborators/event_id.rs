use platforms::LineItem;
use sha2::{Digest, Sha256};

/// Line item reduced to the fields that identify it across client and server.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct NormalizedLineItem {
    pub product_id: String,
    pub variant_id: String,
    pub quantity: u32,
}

impl From<&LineItem> for NormalizedLineItem {
    fn from(item: &LineItem) -> Self {
        Self {
            product_id: item.product_id.trim().to_string(),
            variant_id: item
                .variant_id
                .as_deref()
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
            quantity: item.quantity,
        }
    }
}

pub fn normalize_line_items(items: &[LineItem]) -> Vec<NormalizedLineItem> {
    let mut out: Vec<NormalizedLineItem> = items.iter().map(NormalizedLineItem::from).collect();
    out.sort();
    out
}

#[derive(Clone, Debug)]
pub struct EventIdInput<'a> {
    pub order_id: &'a str,
    pub checkout_token: Option<&'a str>,
    pub event_type: &'a str,
    pub shop_domain: &'a str,
    pub line_items: &'a [NormalizedLineItem],
    pub version: u32,
    pub nonce: Option<&'a str>,
}

/// Deterministic dedup identifier shared by the browser pixel and the server.
pub trait EventIdGenerator: Send + Sync {
    fn generate_canonical_event_id(&self, input: &EventIdInput<'_>) -> String;
}

pub const EVENT_ID_VERSION: u32 = 1;

/// SHA-256 over a canonical key string, hex encoded and cut to 32 chars.
#[derive(Clone, Copy, Debug, Default)]
pub struct Sha256EventIdGenerator;

impl Sha256EventIdGenerator {
    fn canonical_key(input: &EventIdInput<'_>) -> String {
        let mut items: Vec<&NormalizedLineItem> = input.line_items.iter().collect();
        items.sort();
        let items = items
            .iter()
            .map(|i| format!("{}:{}:{}", i.product_id, i.variant_id, i.quantity))
            .collect::<Vec<_>>()
            .join(",");

        format!(
            "v{}|{}|{}|{}|{}|{}|{}",
            input.version,
            input.shop_domain.trim().to_ascii_lowercase(),
            input.order_id.trim(),
            input.checkout_token.map(str::trim).unwrap_or_default(),
            input.event_type.trim().to_ascii_lowercase(),
            items,
            input.nonce.unwrap_or_default(),
        )
    }
}

impl EventIdGenerator for Sha256EventIdGenerator {
    fn generate_canonical_event_id(&self, input: &EventIdInput<'_>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(Self::canonical_key(input).as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[..32].to_string()
    }
}
