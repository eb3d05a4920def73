//! Cart line items

use serde::{Deserialize, Serialize};

/// One line of the cart. Lines are identified by SKU, color and size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub product_sku: String,
    pub color: String,
    pub size: String,
    pub quantity: u32,
    #[serde(default)]
    pub unit_price: f64,
}

impl CartItem {
    pub fn new(product_sku: &str, color: &str, size: &str, quantity: u32) -> Self {
        Self {
            product_sku: product_sku.to_string(),
            color: color.to_string(),
            size: size.to_string(),
            quantity,
            unit_price: 0.0,
        }
    }

    pub fn with_unit_price(mut self, unit_price: f64) -> Self {
        self.unit_price = unit_price;
        self
    }

    pub fn key(&self) -> LineKey {
        LineKey {
            product_sku: self.product_sku.clone(),
            color: self.color.clone(),
            size: self.size.clone(),
        }
    }

    pub fn matches(&self, key: &LineKey) -> bool {
        self.product_sku == key.product_sku && self.color == key.color && self.size == key.size
    }

    pub fn subtotal(&self) -> f64 {
        self.unit_price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineKey {
    pub product_sku: String,
    pub color: String,
    pub size: String,
}

impl LineKey {
    pub fn new(product_sku: &str, color: &str, size: &str) -> Self {
        Self {
            product_sku: product_sku.to_string(),
            color: color.to_string(),
            size: size.to_string(),
        }
    }
}

/// Body of `PUT /cart/items`
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct QuantityUpdate<'a> {
    #[serde(flatten)]
    pub key: &'a LineKey,
    pub quantity: u32,
}

/// Every cart endpoint answers with the full server-side cart.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CartResponse {
    #[serde(default)]
    pub items: Vec<CartItem>,
}
