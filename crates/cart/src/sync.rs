//! Optimistic cart mirror.
//!
//! Every mutation is applied locally at once and then sent through the
//! authenticated request layer, one round trip at a time. The mirror is the
//! last server answer with the mutations still waiting for theirs replayed
//! on top; a terminal failure drops the failed mutation from that replay.

use log::{debug, info, warn};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use storefront_auth::{AuthClient, AuthError, AuthedRequest, SessionState};
use tokio::sync::Mutex;

use crate::error::CartError;
use crate::item::{CartItem, CartResponse, LineKey, QuantityUpdate};
use crate::CartOptions;

#[derive(Debug, Clone)]
enum Mutation {
    Add(CartItem),
    Update { key: LineKey, quantity: u32 },
    Remove(LineKey),
    Clear,
}

impl Mutation {
    fn apply(&self, items: &mut Vec<CartItem>) {
        match self {
            Mutation::Add(item) => match items.iter_mut().find(|line| line.matches(&item.key())) {
                Some(line) => line.quantity = line.quantity.saturating_add(item.quantity),
                None => items.push(item.clone()),
            },
            Mutation::Update { key, quantity } => {
                if let Some(line) = items.iter_mut().find(|line| line.matches(key)) {
                    line.quantity = *quantity;
                }
            }
            Mutation::Remove(key) => items.retain(|line| !line.matches(key)),
            Mutation::Clear => items.clear(),
        }
    }

    fn request<'a>(&self, client: &'a AuthClient) -> Result<AuthedRequest<'a>, AuthError> {
        match self {
            Mutation::Add(item) => client.post("/cart/items").json(item),
            Mutation::Update { key, quantity } => client.put("/cart/items").json(&QuantityUpdate {
                key,
                quantity: *quantity,
            }),
            Mutation::Remove(key) => Ok(client
                .delete("/cart/items")
                .query("productSku", &key.product_sku)
                .query("color", &key.color)
                .query("size", &key.size)),
            Mutation::Clear => Ok(client.delete("/cart")),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Mutation::Add(_) => "add",
            Mutation::Update { .. } => "update",
            Mutation::Remove(_) => "remove",
            Mutation::Clear => "clear",
        }
    }
}

#[derive(Default)]
struct Mirror {
    confirmed: Vec<CartItem>,
    pending: Vec<(u64, Mutation)>,
    items: Vec<CartItem>,
    next_id: u64,
}

impl Mirror {
    fn rebuild(&mut self) {
        let mut items = self.confirmed.clone();
        for (_, mutation) in &self.pending {
            mutation.apply(&mut items);
        }
        self.items = items;
    }

    fn settle(&mut self, id: u64) {
        self.pending.retain(|(pending, _)| *pending != id);
    }
}

/// カート同期
pub struct CartSynchronizer {
    client: Arc<AuthClient>,
    options: CartOptions,
    mirror: RwLock<Mirror>,
    // One round trip at a time; local edits never wait for it.
    in_flight: Mutex<()>,
}

impl CartSynchronizer {
    pub fn new(client: Arc<AuthClient>, options: CartOptions) -> Self {
        Self {
            client,
            options,
            mirror: RwLock::new(Mirror::default()),
            in_flight: Mutex::new(()),
        }
    }

    pub fn options(&self) -> &CartOptions {
        &self.options
    }

    /// Current contents of the local mirror.
    pub fn items(&self) -> Vec<CartItem> {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .clone()
    }

    pub fn item_count(&self) -> u32 {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .iter()
            .fold(0u32, |count, line| count.saturating_add(line.quantity))
    }

    pub fn total(&self) -> f64 {
        self.mirror
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .iter()
            .map(CartItem::subtotal)
            .sum()
    }

    /// Empties the mirror without contacting the server. Mutations still
    /// waiting for an answer are forgotten.
    pub fn reset(&self) {
        *self.write_mirror() = Mirror::default();
        debug!("Cart mirror reset");
    }

    /// Adds `item`, merging it into an existing line with the same key.
    pub async fn add_item(&self, item: CartItem) -> Result<Vec<CartItem>, CartError> {
        self.mutate(Mutation::Add(item)).await
    }

    /// Sets the quantity of a line. Zero removes it.
    pub async fn update_quantity(
        &self,
        key: &LineKey,
        quantity: u32,
    ) -> Result<Vec<CartItem>, CartError> {
        if quantity == 0 {
            return self.remove_item(key).await;
        }
        self.mutate(Mutation::Update {
            key: key.clone(),
            quantity,
        })
        .await
    }

    pub async fn remove_item(&self, key: &LineKey) -> Result<Vec<CartItem>, CartError> {
        self.mutate(Mutation::Remove(key.clone())).await
    }

    pub async fn clear(&self) -> Result<Vec<CartItem>, CartError> {
        self.mutate(Mutation::Clear).await
    }

    /// Replaces the mirror with the server's cart. Guests get the mirror
    /// back unchanged.
    pub async fn fetch_canonical(&self) -> Result<Vec<CartItem>, CartError> {
        let _guard = self.in_flight.lock().await;
        self.fetch_locked().await
    }

    async fn fetch_locked(&self) -> Result<Vec<CartItem>, CartError> {
        if self.is_guest() {
            return Ok(self.items());
        }

        let epoch = self.client.session().epoch();
        let response: CartResponse = self.client.get("/cart").execute().await?;
        if self.client.session().epoch() != epoch {
            warn!("Discarding cart fetched by an ended session");
            return Err(CartError::SessionEnded);
        }
        Ok(self.confirm(response.items))
    }

    async fn mutate(&self, mutation: Mutation) -> Result<Vec<CartItem>, CartError> {
        let epoch = self.client.session().epoch();

        if self.is_guest() {
            let mut mirror = self.write_mirror();
            mutation.apply(&mut mirror.confirmed);
            mirror.rebuild();
            debug!("Guest cart {} applied locally", mutation.name());
            return Ok(mirror.items.clone());
        }

        let id = {
            let mut mirror = self.write_mirror();
            let id = mirror.next_id;
            mirror.next_id += 1;
            mutation.apply(&mut mirror.items);
            mirror.pending.push((id, mutation.clone()));
            id
        };

        let _guard = self.in_flight.lock().await;
        let result = if self.client.session().epoch() == epoch {
            Some(self.send_with_backoff(&mutation).await)
        } else {
            None
        };

        let result = match result {
            Some(result) if self.client.session().epoch() == epoch => result,
            _ => {
                warn!("Discarding cart {} answer from an ended session", mutation.name());
                self.write_mirror().settle(id);
                return Err(CartError::SessionEnded);
            }
        };

        match result {
            Ok(response) => {
                let mut mirror = self.write_mirror();
                mirror.settle(id);
                mirror.confirmed = response.items;
                mirror.rebuild();
                Ok(mirror.items.clone())
            }
            Err(err) => {
                warn!("Cart {} failed, rolling back: {}", mutation.name(), err);
                {
                    let mut mirror = self.write_mirror();
                    mirror.settle(id);
                    mirror.rebuild();
                }
                if let Err(resync) = self.fetch_locked().await {
                    debug!("Cart resync after rollback failed: {}", resync);
                }
                Err(err)
            }
        }
    }

    async fn send_with_backoff(&self, mutation: &Mutation) -> Result<CartResponse, CartError> {
        let mut attempt = 1;
        loop {
            match mutation.request(&self.client)?.execute::<CartResponse>().await {
                Ok(response) => return Ok(response),
                Err(AuthError::Conflict(message)) if attempt < self.options.max_attempts => {
                    let delay = self.options.backoff_delay(attempt);
                    info!(
                        "Cart {} conflicted ({}), attempt {} of {}, retrying in {:?}",
                        mutation.name(),
                        message,
                        attempt,
                        self.options.max_attempts,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(AuthError::Conflict(_)) => {
                    return Err(CartError::ConflictExhausted { attempts: attempt })
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn is_guest(&self) -> bool {
        self.client.state() == SessionState::Anonymous
    }

    /// Takes `items` as the server's cart and replays pending mutations.
    fn confirm(&self, items: Vec<CartItem>) -> Vec<CartItem> {
        let mut mirror = self.write_mirror();
        mirror.confirmed = items;
        mirror.rebuild();
        mirror.items.clone()
    }

    fn write_mirror(&self) -> RwLockWriteGuard<'_, Mirror> {
        self.mirror.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines() -> Vec<CartItem> {
        vec![
            CartItem::new("TEE-01", "black", "M", 1).with_unit_price(20.0),
            CartItem::new("CAP-02", "red", "L", 2).with_unit_price(12.5),
        ]
    }

    #[test]
    fn test_add_merges_matching_line() {
        let mut items = lines();
        Mutation::Add(CartItem::new("TEE-01", "black", "M", 2)).apply(&mut items);
        Mutation::Add(CartItem::new("TEE-01", "white", "M", 1)).apply(&mut items);

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].quantity, 3);
    }

    #[test]
    fn test_update_remove_clear() {
        let mut items = lines();
        let cap = LineKey::new("CAP-02", "red", "L");

        Mutation::Update {
            key: cap.clone(),
            quantity: 5,
        }
        .apply(&mut items);
        assert_eq!(items[1].quantity, 5);

        Mutation::Remove(cap).apply(&mut items);
        assert_eq!(items.len(), 1);

        Mutation::Clear.apply(&mut items);
        assert!(items.is_empty());
    }

    #[test]
    fn test_add_saturates_quantity() {
        let mut items = vec![CartItem::new("TEE-01", "black", "M", u32::MAX)];
        Mutation::Add(CartItem::new("TEE-01", "black", "M", 1)).apply(&mut items);
        assert_eq!(items[0].quantity, u32::MAX);
    }

    #[test]
    fn test_rebuild_replays_pending_over_confirmed() {
        let mut mirror = Mirror {
            confirmed: lines(),
            ..Mirror::default()
        };
        mirror
            .pending
            .push((0, Mutation::Remove(LineKey::new("TEE-01", "black", "M"))));
        mirror
            .pending
            .push((1, Mutation::Add(CartItem::new("SOCK-9", "grey", "S", 3))));
        mirror.rebuild();
        assert_eq!(mirror.items.len(), 2);

        // 失敗した変更だけを取り除く
        mirror.settle(0);
        mirror.rebuild();
        assert_eq!(mirror.items.len(), 3);
        assert_eq!(mirror.items[0].product_sku, "TEE-01");
        assert_eq!(mirror.items[2].product_sku, "SOCK-9");
    }
}
