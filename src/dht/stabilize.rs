use log::{debug, info, warn};

use super::node::RingNode;

impl RingNode {
    /// Re-resolves every finger `i` in `1..bits` as the owner of `id + 2^(i-1)`.
    pub async fn refresh_fingers(&self) {
        let ring = self.ring();
        for index in 1..ring.bits() {
            let start = ring.finger_start(self.me.id, index);
            match self.owner(start, 0).await {
                Ok(owner) => {
                    let entry = (!self.is_me(&owner)).then_some(owner);
                    self.fingers.write().await.set(index, entry);
                }
                Err(err) => warn!(
                    "Node {} could not resolve finger {} (key {}): {}",
                    self.me, index, start, err
                ),
            }
        }
    }

    pub async fn stabilize(&self) {
        debug!("Node {} stabilizing", self.me);
        self.refresh_fingers().await;
        info!("Node {} refreshed its finger table", self.me);
    }
}
